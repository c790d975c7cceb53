pub const APP_NAME: &str = "twinpane";

/// Directory under the user config dir holding twinpane files.
pub const CONFIG_DIR_NAME: &str = "twinpane";
pub const PROFILES_FILE_NAME: &str = "sources.json";

/// Name of the profile that is always available, browsing the local disk.
pub const LOCAL_PROFILE: &str = "local";

pub const LOG_PREFIX: &str = "[twinpane]";
