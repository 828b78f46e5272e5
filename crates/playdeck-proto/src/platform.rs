use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9613;
const DAEMON_TCP_HOST: &str = "127.0.0.1";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

/// IPC socket name for the engine instance bound to one track.  Each bound
/// entry owns its own mpv process, so the name carries the instance tag.
#[cfg(unix)]
pub fn engine_socket_name(instance: &str) -> String {
    format!(
        "{}/playdeck-mpv-{}.sock",
        std::env::temp_dir().display(),
        instance
    )
}

#[cfg(windows)]
pub fn engine_socket_name(instance: &str) -> String {
    format!("playdeck-mpv-{}", instance)
}

#[cfg(unix)]
pub fn engine_socket_arg(instance: &str) -> String {
    format!("--input-ipc-server={}", engine_socket_name(instance))
}

#[cfg(windows)]
pub fn engine_socket_arg(instance: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", engine_socket_name(instance))
}

/// Locate the mpv binary: PATH first, then common install locations.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let exe_name = if cfg!(windows) { "mpv.exe" } else { "mpv" };

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(exe_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    let fallbacks: &[&str] = if cfg!(target_os = "macos") {
        &["/opt/homebrew/bin/mpv", "/usr/local/bin/mpv"]
    } else if cfg!(unix) {
        &["/usr/bin/mpv", "/usr/local/bin/mpv"]
    } else {
        &[]
    };
    fallbacks
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/playdeck/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("playdeck")
    }
    #[cfg(windows)]
    {
        // On Windows, check for portable data directory in executable directory first
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_data = exe_dir.join("data");
                if portable_data.exists() {
                    return portable_data;
                }
            }
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("playdeck")
    }
}

pub fn config_dir() -> PathBuf {
    // On Windows, check for portable config.toml in executable directory first
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_config = exe_dir.join("config.toml");
                if portable_config.exists() {
                    return exe_dir.to_path_buf();
                }
            }
        }
    }

    // On macOS and Linux, always use ~/.config/playdeck/
    // (avoid macOS Application Support folder for consistency)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("playdeck")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("playdeck")
    }
}
