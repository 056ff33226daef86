//! Platform binding selection.
//!
//! One prebuilt native artifact exists per (platform, arch) pair. The pair is
//! read once, looked up in [`BINDINGS`], and turned into a [`NexusContext`]:
//! the capability object every server and build operation goes through.

use crate::bundle::{self, BuildOutput};
use crate::config::NexusConfig;
use crate::dev::{self, ServerHandle};
use crate::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A prebuilt artifact for one host pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    pub platform: &'static str,
    pub arch: &'static str,
    /// Package name the artifact ships under.
    pub artifact: &'static str,
}

impl BindingSpec {
    /// `platform-arch` pair, e.g. `linux-x64`.
    #[must_use]
    pub fn pair(&self) -> String {
        format!("{}-{}", self.platform, self.arch)
    }
}

/// Every supported host pair.
pub const BINDINGS: &[BindingSpec] = &[
    BindingSpec {
        platform: "win32",
        arch: "x64",
        artifact: "@apexjs/core-win32-x64-msvc",
    },
    BindingSpec {
        platform: "darwin",
        arch: "x64",
        artifact: "@apexjs/core-darwin-x64",
    },
    BindingSpec {
        platform: "darwin",
        arch: "arm64",
        artifact: "@apexjs/core-darwin-arm64",
    },
    BindingSpec {
        platform: "linux",
        arch: "x64",
        artifact: "@apexjs/core-linux-x64-gnu",
    },
];

/// Host operating system and CPU architecture, in artifact naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub platform: String,
    pub arch: String,
}

impl HostInfo {
    #[must_use]
    pub fn new(platform: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            arch: arch.into(),
        }
    }

    /// The running host.
    #[must_use]
    pub fn current() -> Self {
        let platform = match std::env::consts::OS {
            "windows" => "win32",
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            "x86" => "ia32",
            other => other,
        };
        Self::new(platform, arch)
    }

    #[must_use]
    pub fn pair(&self) -> String {
        format!("{}-{}", self.platform, self.arch)
    }
}

/// Supported pairs, in table order.
#[must_use]
pub fn supported_pairs() -> Vec<String> {
    BINDINGS.iter().map(BindingSpec::pair).collect()
}

/// Look up the artifact for `host`.
pub fn select_binding(host: &HostInfo) -> Result<&'static BindingSpec, Error> {
    BINDINGS
        .iter()
        .find(|b| b.platform == host.platform && b.arch == host.arch)
        .ok_or_else(|| Error::UnsupportedPlatform {
            platform: host.pair(),
            supported: supported_pairs(),
        })
}

/// Select and initialize the binding for `host`, returning the context every
/// other operation runs against.
pub fn load_binding(host: HostInfo, config: NexusConfig) -> Result<NexusContext, Error> {
    NexusContext::for_host(host, config)
}

/// Explicitly constructed process context: selected binding, configuration
/// and the bounded transform pool.
#[derive(Debug, Clone)]
pub struct NexusContext {
    binding: &'static BindingSpec,
    host: HostInfo,
    config: NexusConfig,
    pool: Arc<rayon::ThreadPool>,
}

impl NexusContext {
    /// Select the binding for the running host and initialize it.
    pub fn load(config: NexusConfig) -> Result<Self, Error> {
        Self::for_host(HostInfo::current(), config)
    }

    /// Select the binding for an explicit host and initialize it.
    pub fn for_host(host: HostInfo, config: NexusConfig) -> Result<Self, Error> {
        let binding = select_binding(&host)?;
        let workers = config
            .workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nexus-transform-{i}"))
            .build()
            .map_err(|e| Error::BindingLoad {
                artifact: binding.artifact.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            artifact = binding.artifact,
            host = %host.pair(),
            workers,
            "Native binding initialized"
        );

        Ok(Self {
            binding,
            host,
            config,
            pool: Arc::new(pool),
        })
    }

    #[must_use]
    pub fn binding(&self) -> &'static BindingSpec {
        self.binding
    }

    #[must_use]
    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    #[must_use]
    pub fn config(&self) -> &NexusConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.pool
    }

    /// Start the dev server for `root_dir` on `port` (0 picks a free port).
    ///
    /// Fails if `root_dir` does not exist or `port` is already bound.
    pub async fn start_server(&self, root_dir: &Path, port: u16) -> Result<ServerHandle, Error> {
        dev::start_server(self, root_dir, port).await
    }

    /// Run a production build of the configured root.
    pub fn build(&self) -> Result<BuildOutput, Error> {
        bundle::build(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_binding_for_each_supported_pair() {
        for spec in BINDINGS {
            let host = HostInfo::new(spec.platform, spec.arch);
            assert_eq!(select_binding(&host).unwrap().artifact, spec.artifact);
        }
    }

    #[test]
    fn test_linux_uses_gnu_artifact() {
        let spec = select_binding(&HostInfo::new("linux", "x64")).unwrap();
        assert_eq!(spec.artifact, "@apexjs/core-linux-x64-gnu");
    }

    #[test]
    fn test_unsupported_platform_names_pair_and_supported_list() {
        let err = select_binding(&HostInfo::new("linux", "arm64")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported platform: linux-arm64. Nexus supports: win32-x64, darwin-x64, darwin-arm64, linux-x64"
        );
    }

    #[test]
    fn test_context_for_host_builds_pool() {
        let config = NexusConfig::new(".").with_workers(2);
        let ctx = NexusContext::for_host(HostInfo::new("darwin", "arm64"), config).unwrap();
        assert_eq!(ctx.pool().current_num_threads(), 2);
        assert_eq!(ctx.binding().pair(), "darwin-arm64");
    }

    #[test]
    fn test_load_binding_rejects_unsupported_host() {
        let err = load_binding(HostInfo::new("freebsd", "x64"), NexusConfig::new(".")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform { .. }));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let a = NexusContext::for_host(
            HostInfo::new("linux", "x64"),
            NexusConfig::new("/a").with_port(1),
        )
        .unwrap();
        let b = NexusContext::for_host(
            HostInfo::new("linux", "x64"),
            NexusConfig::new("/b").with_port(2),
        )
        .unwrap();
        assert_ne!(a.config().port, b.config().port);
        assert!(!Arc::ptr_eq(a.pool(), b.pool()));
    }

    #[test]
    fn test_current_host_maps_names() {
        let host = HostInfo::current();
        assert_ne!(host.platform, "windows");
        assert_ne!(host.platform, "macos");
        assert_ne!(host.arch, "x86_64");
    }
}
