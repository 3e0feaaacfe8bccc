use crate::consts::APP_NAME;
use std::path::PathBuf;

/// Returns the user's home directory, if the environment names one.
#[cfg(windows)]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").map(PathBuf::from)
}

/// Returns the user's home directory, if the environment names one.
#[cfg(not(windows))]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").map(PathBuf::from)
}

/// Returns the per-user cache directory for the application
#[cfg(windows)]
pub fn user_cache_dir() -> Option<PathBuf> {
  std::env::var_os("LOCALAPPDATA").map(|dir| PathBuf::from(dir).join(APP_NAME).join("Cache"))
}

/// Returns the per-user cache directory for the application
#[cfg(not(windows))]
pub fn user_cache_dir() -> Option<PathBuf> {
  let cache_home = std::env::var_os("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .or_else(|| home_dir().map(|home| home.join(".cache")))?;
  Some(cache_home.join(APP_NAME))
}
