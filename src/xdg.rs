//! XDG Base Directory support for ifcache
//!
//! Follows the XDG Base Directory Specification:
//! - https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
//!
//! Directory structure:
//! - `$XDG_CACHE_HOME/ifcache/` (default: `~/.cache/ifcache/`) - Result store
//! - `$XDG_CONFIG_HOME/ifcache/` (default: `~/.config/ifcache/`) - Global configuration

use std::path::PathBuf;

/// Default result store root
///
/// Respects XDG_CACHE_HOME environment variable.
/// Falls back to `$HOME/.cache/ifcache` on Unix, or appropriate path on other platforms.
///
/// # Example
/// ```
/// let cache_dir = ifcache::xdg::cache_dir();
/// // Unix: ~/.cache/ifcache or $XDG_CACHE_HOME/ifcache
/// ```
pub fn cache_dir() -> PathBuf {
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache).join("ifcache")
    } else if let Some(cache) = dirs::cache_dir() {
        cache.join("ifcache")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".cache").join("ifcache")
    } else {
        PathBuf::from(".ifcache-cache")
    }
}

/// Global configuration directory
///
/// Respects XDG_CONFIG_HOME environment variable.
/// Falls back to `$HOME/.config/ifcache`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("ifcache")
    } else if let Some(home) = dirs::home_dir() {
        // XDG spec default: $HOME/.config
        home.join(".config").join("ifcache")
    } else {
        PathBuf::from(".ifcache-config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cache_dir_respects_xdg_env() {
        std::env::set_var("XDG_CACHE_HOME", "/tmp/test-cache");
        let dir = cache_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-cache/ifcache"));
        std::env::remove_var("XDG_CACHE_HOME");
    }

    #[test]
    #[serial]
    fn test_config_dir_respects_xdg_env() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/test-config");
        let dir = config_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-config/ifcache"));
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
