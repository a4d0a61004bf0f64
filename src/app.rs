pub const APP_NAME: &str = "小红书管理平台";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_ID: &str = env!("CARGO_PKG_NAME");

/// Backend executable names, checked in this order
pub const BACKEND_PRIMARY_NAME: &str = "xiaohongshu-mcp-desktop";
pub const BACKEND_LEGACY_NAME: &str = "xiaohongshu-mcp";

/// Directory next to the shell (or inside its resources) that holds the backend
pub const BACKEND_DIR_NAME: &str = "backend";

pub const DEFAULT_PREFERRED_PORT: u16 = 18060;
pub const DEFAULT_FALLBACK_PORT: u16 = 8080;
pub const DEFAULT_PORT_RANGE_LEN: u16 = 100;

/// File name of a backend executable on the current platform
pub fn executable_file_name(name: &str) -> String {
    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
}

/// URL the presentation layer loads once the backend is healthy
pub fn backend_url(port: u16) -> String {
    format!("http://localhost:{}/", port)
}
