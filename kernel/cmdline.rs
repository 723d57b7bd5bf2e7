//! Kernel command line parsing
//!
//! Parses the bootloader command line into `KernelConfig` before the heap
//! exists, so everything lives in fixed-size storage.
//!
//! ## Supported Options
//!
//! - `xallocv1` - select the Xalloc V1 (slab) heap algorithm
//! - `liballoc11` - select the liballoc-1.1 (free-list) heap algorithm
//! - `bootanim=0/1` - disable/enable the boot animation thread
//! - `init=<path>` - override the default init program path
//!
//! Unknown options are ignored.

use crate::mm::heap::HeapAlgorithm;

/// Maximum stored init path length
const MAX_INIT_PATH: usize = 128;

/// Default init program path
const DEFAULT_INIT_PATH: &str = "/bin/init";

/// Parsed kernel configuration
#[derive(Clone, Copy)]
pub struct KernelConfig {
    /// Selected heap algorithm
    pub allocator: HeapAlgorithm,
    /// Whether the boot animation thread is spawned
    pub boot_animation: bool,
    /// Init program path
    init_path: [u8; MAX_INIT_PATH],
    /// Init path length
    init_path_len: usize,
}

impl KernelConfig {
    /// Configuration with all defaults
    pub const fn new() -> Self {
        let mut cfg = Self {
            allocator: HeapAlgorithm::Pages,
            boot_animation: false,
            init_path: [0; MAX_INIT_PATH],
            init_path_len: 0,
        };
        let default = DEFAULT_INIT_PATH.as_bytes();
        let mut i = 0;
        while i < default.len() {
            cfg.init_path[i] = default[i];
            i += 1;
        }
        cfg.init_path_len = default.len();
        cfg
    }

    /// Init program path as a str
    pub fn init_path(&self) -> &str {
        core::str::from_utf8(&self.init_path[..self.init_path_len]).unwrap_or(DEFAULT_INIT_PATH)
    }

    fn set_init_path(&mut self, path: &str) {
        let bytes = path.as_bytes();
        let len = bytes.len().min(MAX_INIT_PATH);
        self.init_path[..len].copy_from_slice(&bytes[..len]);
        self.init_path_len = len;
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a kernel command line into a configuration
pub fn parse_config(cmdline: &str) -> KernelConfig {
    let mut config = KernelConfig::new();

    for option in cmdline.split_whitespace() {
        match option {
            "xallocv1" => config.allocator = HeapAlgorithm::XallocV1,
            "liballoc11" => config.allocator = HeapAlgorithm::LibAlloc11,
            "bootanim=0" => config.boot_animation = false,
            "bootanim=1" => config.boot_animation = true,
            _ => {
                if let Some(path) = option.strip_prefix("init=")
                    && !path.is_empty()
                {
                    config.set_init_path(path);
                }
                // Unknown options are ignored
            }
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_config("");
        assert_eq!(config.allocator, HeapAlgorithm::Pages);
        assert!(!config.boot_animation);
        assert_eq!(config.init_path(), "/bin/init");
    }

    #[test]
    fn test_allocator_selection() {
        assert_eq!(parse_config("xallocv1").allocator, HeapAlgorithm::XallocV1);
        assert_eq!(
            parse_config("quiet liballoc11").allocator,
            HeapAlgorithm::LibAlloc11
        );
    }

    #[test]
    fn test_bootanim_and_init_override() {
        let config = parse_config("bootanim=1 init=/system/init");
        assert!(config.boot_animation);
        assert_eq!(config.init_path(), "/system/init");
    }

    #[test]
    fn test_unknown_options_ignored() {
        let config = parse_config("noacpi init= maxcpus=2");
        assert_eq!(config.init_path(), "/bin/init");
        assert_eq!(config.allocator, HeapAlgorithm::Pages);
    }
}
