use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "tokengateway";
pub const APP_NAME: &str = "gateway";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("GATEWAY_CONFIG") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("gateway.json"))
}

pub fn ipc_socket_path() -> anyhow::Result<PathBuf> {
    #[cfg(unix)]
    {
        Ok(data_dir()?.join("gateway.ipc"))
    }
    #[cfg(windows)]
    {
        Ok(PathBuf::from(r"\\.\pipe\TokenGatewayIpc"))
    }
}
