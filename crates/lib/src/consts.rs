//! Names and defaults shared across the engine.

pub const APP_NAME: &str = "kiln";

/// Project configuration file, looked up at the project root.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

/// Default name of the per-package declaration file.
pub const DEFAULT_BUILD_FILE_NAME: &str = "BUILD.json";

/// Directory (relative to the project root) that receives rule outputs.
pub const OUTPUT_DIR: &str = "kiln-out";

/// Default local artifact cache directory, relative to the project root.
pub const DEFAULT_CACHE_DIR: &str = ".kiln-cache";

/// Marker written last into a cache entry once it is complete.
pub const CACHE_COMPLETE_MARKER: &str = ".kiln-complete";

/// Version of the on-disk cache entry layout.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Flag appended to a test tool invocation to list tests without running them.
pub const DEFAULT_TEST_LIST_FLAG: &str = "-listTestsOnly";

/// Flag preceding each generated test filter argument.
pub const DEFAULT_TEST_FILTER_FLAG: &str = "-only";

/// The visibility pattern that matches every target.
pub const VISIBILITY_PUBLIC: &str = "PUBLIC";
