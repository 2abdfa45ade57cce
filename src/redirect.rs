//! Kernel Redirector Module
//!
//! Loads the compiled eBPF object and attaches its three programs to the root
//! cgroup: `cg_connect4` rewrites outbound IPv4 connects to the local proxy
//! while stashing the intended destination, `cg_sock_ops` correlates the
//! rewritten flow with that destination by socket cookie, and `cg_sock_opt`
//! answers the proxy's `SO_ORIGINAL_DST` queries. User space publishes
//! `{proxy_port, proxy_pid}` into the single-entry configuration map so the
//! connect hook can skip the proxy's own sockets.
//!
//! Attachment failure is not fatal to the proxy; the caller logs it and keeps
//! running as an idle listener.

/// Payload of the single-entry kernel configuration map, keyed by `u32 0`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub proxy_port: u16,
    _pad: [u8; 6],
    pub proxy_pid: u64,
}

impl KernelConfig {
    pub fn new(proxy_port: u16, proxy_pid: u64) -> Self {
        Self {
            proxy_port,
            _pad: [0; 6],
            proxy_pid,
        }
    }
}

#[cfg(target_os = "linux")]
unsafe impl aya::Pod for KernelConfig {}

#[cfg(target_os = "linux")]
pub use linux::Redirector;
#[cfg(not(target_os = "linux"))]
pub use stub::Redirector;

#[cfg(target_os = "linux")]
mod linux {
    use super::KernelConfig;
    use crate::config::RedirectConfig;
    use crate::{ProxyError, Result};
    use aya::maps::HashMap as KernelMap;
    use aya::programs::cgroup_sock_addr::CgroupSockAddrLink;
    use aya::programs::cgroup_sockopt::CgroupSockoptLink;
    use aya::programs::sock_ops::SockOpsLink;
    use aya::programs::{CgroupAttachMode, CgroupSockAddr, CgroupSockopt, SockOps};
    use aya::Ebpf;
    use std::fs::File;
    use tracing::info;

    const CONNECT4_PROGRAM: &str = "cg_connect4";
    const SOCK_OPS_PROGRAM: &str = "cg_sock_ops";
    const GETSOCKOPT_PROGRAM: &str = "cg_sock_opt";
    const CONFIG_MAP: &str = "map_config";
    const CONFIG_KEY: u32 = 0;

    fn attach_err(what: &str, error: impl std::fmt::Display) -> ProxyError {
        ProxyError::AttachHook(format!("{}: {}", what, error))
    }

    /// Holds the loaded object and its cgroup links; dropping it detaches all
    /// three programs
    pub struct Redirector {
        _connect4: CgroupSockAddrLink,
        _sock_ops: SockOpsLink,
        _sockopt: CgroupSockoptLink,
        _bpf: Ebpf,
    }

    impl Redirector {
        /// Load the object file, attach the hooks, and publish the proxy's
        /// port and PID to the kernel
        pub fn attach(config: &RedirectConfig, proxy_port: u16) -> Result<Self> {
            let mut bpf = Ebpf::load_file(&config.bpf_object_path).map_err(|e| {
                attach_err(
                    &format!("loading {}", config.bpf_object_path.display()),
                    e,
                )
            })?;
            let cgroup = File::open(&config.cgroup_path).map_err(|e| {
                attach_err(&format!("opening {}", config.cgroup_path.display()), e)
            })?;

            let connect4_link = {
                let program: &mut CgroupSockAddr = bpf
                    .program_mut(CONNECT4_PROGRAM)
                    .ok_or_else(|| attach_err(CONNECT4_PROGRAM, "program not found"))?
                    .try_into()
                    .map_err(|e| attach_err(CONNECT4_PROGRAM, e))?;
                program.load().map_err(|e| attach_err(CONNECT4_PROGRAM, e))?;
                let link_id = program
                    .attach(&cgroup, CgroupAttachMode::Single)
                    .map_err(|e| attach_err(CONNECT4_PROGRAM, e))?;
                program
                    .take_link(link_id)
                    .map_err(|e| attach_err(CONNECT4_PROGRAM, e))?
            };

            let sock_ops_link = {
                let program: &mut SockOps = bpf
                    .program_mut(SOCK_OPS_PROGRAM)
                    .ok_or_else(|| attach_err(SOCK_OPS_PROGRAM, "program not found"))?
                    .try_into()
                    .map_err(|e| attach_err(SOCK_OPS_PROGRAM, e))?;
                program.load().map_err(|e| attach_err(SOCK_OPS_PROGRAM, e))?;
                let link_id = program
                    .attach(&cgroup, CgroupAttachMode::Single)
                    .map_err(|e| attach_err(SOCK_OPS_PROGRAM, e))?;
                program
                    .take_link(link_id)
                    .map_err(|e| attach_err(SOCK_OPS_PROGRAM, e))?
            };

            let sockopt_link = {
                let program: &mut CgroupSockopt = bpf
                    .program_mut(GETSOCKOPT_PROGRAM)
                    .ok_or_else(|| attach_err(GETSOCKOPT_PROGRAM, "program not found"))?
                    .try_into()
                    .map_err(|e| attach_err(GETSOCKOPT_PROGRAM, e))?;
                program
                    .load()
                    .map_err(|e| attach_err(GETSOCKOPT_PROGRAM, e))?;
                let link_id = program
                    .attach(&cgroup, CgroupAttachMode::Single)
                    .map_err(|e| attach_err(GETSOCKOPT_PROGRAM, e))?;
                program
                    .take_link(link_id)
                    .map_err(|e| attach_err(GETSOCKOPT_PROGRAM, e))?
            };

            let proxy_pid = std::process::id() as u64;
            {
                let map = bpf
                    .map_mut(CONFIG_MAP)
                    .ok_or_else(|| attach_err(CONFIG_MAP, "map not found"))?;
                let mut kernel_config: KernelMap<_, u32, KernelConfig> =
                    KernelMap::try_from(map).map_err(|e| attach_err(CONFIG_MAP, e))?;
                kernel_config
                    .insert(CONFIG_KEY, KernelConfig::new(proxy_port, proxy_pid), 0)
                    .map_err(|e| attach_err(CONFIG_MAP, e))?;
            }

            info!(
                "Kernel redirection attached at {} (proxy port {}, pid {})",
                config.cgroup_path.display(),
                proxy_port,
                proxy_pid
            );

            Ok(Self {
                _connect4: connect4_link,
                _sock_ops: sock_ops_link,
                _sockopt: sockopt_link,
                _bpf: bpf,
            })
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod stub {
    use crate::config::RedirectConfig;
    use crate::{ProxyError, Result};

    /// Non-Linux stand-in; attachment always reports failure and the proxy
    /// degrades to an idle listener
    pub struct Redirector;

    impl Redirector {
        pub fn attach(_config: &RedirectConfig, _proxy_port: u16) -> Result<Self> {
            Err(ProxyError::AttachHook(
                "cgroup eBPF redirection requires Linux".to_string(),
            ))
        }
    }
}
