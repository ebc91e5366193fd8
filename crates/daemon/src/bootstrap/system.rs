//! Process-level operations used during startup.
//!
//! Everything that changes process identity or needs elevated privileges
//! goes through [`SystemOps`], so the startup sequence can be exercised
//! against a fake that models those rules without being root.

use std::fmt;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, TcpListener, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn6};
use nix::unistd::{Gid, Uid, User};

/// Pending connection queue for listeners.
const LISTEN_BACKLOG: i32 = 1024;

/// Address family filter for listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindProto {
    /// Any family.
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl BindProto {
    pub fn parse(proto: &str) -> Option<Self> {
        match proto {
            "tcp" => Some(Self::Tcp),
            "tcp4" => Some(Self::Tcp4),
            "tcp6" => Some(Self::Tcp6),
            _ => None,
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for BindProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        })
    }
}

/// What to bind: an address in `host:port` form plus a family filter.
///
/// An empty host (`:8080`) means every interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub proto: BindProto,
    pub addr: String,
}

impl BindSpec {
    pub fn new(proto: BindProto, addr: impl Into<String>) -> Self {
        Self {
            proto,
            addr: addr.into(),
        }
    }

    /// Port number, if the address carries a valid one.
    pub fn port(&self) -> Option<u16> {
        self.addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    /// The IPv6 wildcard to bind when `tcp` is asked to listen on every
    /// interface. Such a socket takes IPv4 connections as well.
    pub fn dual_stack(&self) -> Option<SocketAddrV6> {
        if self.proto != BindProto::Tcp || !self.addr.starts_with(':') {
            return None;
        }
        let port = self.port()?;
        Some(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
    }

    /// Resolve to socket addresses of the requested family.
    ///
    /// `:port` resolves to the IPv4 wildcard, or the IPv6 one for `tcp6`.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addr = if self.addr.starts_with(':') {
            match self.proto {
                BindProto::Tcp6 => format!("[::]{}", self.addr),
                _ => format!("0.0.0.0{}", self.addr),
            }
        } else {
            self.addr.clone()
        };

        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()?
            .filter(|a| self.proto.accepts(a))
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", self.proto, self.addr),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proto, self.addr)
    }
}

/// Numeric identity of the user to run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIds {
    pub uid: u32,
    pub gid: u32,
}

/// Identity, filesystem root and socket operations.
pub trait SystemOps {
    /// Look up a user by name. `Ok(None)` when no such user exists.
    fn lookup_user(&mut self, name: &str) -> io::Result<Option<UserIds>>;

    /// Change the root directory and move into it.
    fn chroot(&mut self, dir: &Path) -> io::Result<()>;

    /// Bind a non-blocking listener.
    fn bind(&mut self, spec: &BindSpec) -> io::Result<TcpListener>;

    /// Set the group identity (and supplementary groups where supported).
    fn set_gid(&mut self, gid: u32) -> io::Result<()>;

    /// Set the user identity.
    fn set_uid(&mut self, uid: u32) -> io::Result<()>;

    fn effective_uid(&self) -> u32;
}

/// The real thing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSystem;

impl SystemOps for UnixSystem {
    fn lookup_user(&mut self, name: &str) -> io::Result<Option<UserIds>> {
        let user = User::from_name(name)?;
        Ok(user.map(|u| UserIds {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        }))
    }

    fn chroot(&mut self, dir: &Path) -> io::Result<()> {
        nix::unistd::chroot(dir)?;
        nix::unistd::chdir("/")?;
        Ok(())
    }

    fn bind(&mut self, spec: &BindSpec) -> io::Result<TcpListener> {
        let listener = match spec.dual_stack() {
            Some(addr) => match bind_dual_stack(addr) {
                Ok(listener) => listener,
                Err(e) if is_no_ipv6(&e) => {
                    tracing::debug!(error = %e, "IPv6 unavailable, listening on IPv4 only");
                    TcpListener::bind(&spec.resolve()?[..])?
                }
                Err(e) => return Err(e),
            },
            None => TcpListener::bind(&spec.resolve()?[..])?,
        };
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn set_gid(&mut self, gid: u32) -> io::Result<()> {
        let gid = Gid::from_raw(gid);
        #[cfg(target_os = "linux")]
        nix::unistd::setgroups(&[gid])?;
        nix::unistd::setgid(gid)?;
        Ok(())
    }

    fn set_uid(&mut self, uid: u32) -> io::Result<()> {
        nix::unistd::setuid(Uid::from_raw(uid))?;
        Ok(())
    }

    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }
}

/// IPv6 wildcard listener with `IPV6_V6ONLY` cleared, so IPv4 peers
/// arrive as mapped addresses.
fn bind_dual_stack(addr: SocketAddrV6) -> io::Result<TcpListener> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = SockFlag::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = SockFlag::empty();

    let fd = socket::socket(AddressFamily::Inet6, SockType::Stream, flags, None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    socket::setsockopt(&fd, sockopt::Ipv6V6Only, &false)?;
    socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(addr))?;
    socket::listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
    Ok(TcpListener::from(fd))
}

fn is_no_ipv6(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == nix::libc::EAFNOSUPPORT || code == nix::libc::EADDRNOTAVAIL
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_proto_parse() {
        assert_eq!(BindProto::parse("tcp4"), Some(BindProto::Tcp4));
        assert_eq!(BindProto::parse("udp"), None);
    }

    #[test]
    fn test_port() {
        assert_eq!(BindSpec::new(BindProto::Tcp, ":443").port(), Some(443));
        assert_eq!(BindSpec::new(BindProto::Tcp, "[::1]:8080").port(), Some(8080));
        assert_eq!(BindSpec::new(BindProto::Tcp, "nope").port(), None);
    }

    #[test]
    fn test_resolve_empty_host() {
        let v4 = BindSpec::new(BindProto::Tcp, ":8080").resolve().unwrap();
        assert_eq!(v4, vec!["0.0.0.0:8080".parse().unwrap()]);

        let v6 = BindSpec::new(BindProto::Tcp6, ":8080").resolve().unwrap();
        assert_eq!(v6, vec!["[::]:8080".parse().unwrap()]);
    }

    #[test]
    fn test_dual_stack_only_for_tcp_wildcard() {
        assert_eq!(
            BindSpec::new(BindProto::Tcp, ":8080").dual_stack(),
            Some(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 8080, 0, 0))
        );
        assert_eq!(BindSpec::new(BindProto::Tcp4, ":8080").dual_stack(), None);
        assert_eq!(BindSpec::new(BindProto::Tcp6, ":8080").dual_stack(), None);
        assert_eq!(
            BindSpec::new(BindProto::Tcp, "127.0.0.1:8080").dual_stack(),
            None
        );
    }

    #[test]
    fn test_unix_bind_wildcard_accepts_ipv4() {
        let mut system = UnixSystem;
        let listener = system.bind(&BindSpec::new(BindProto::Tcp, ":0")).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port > 0);
        std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_resolve_filters_family() {
        let result = BindSpec::new(BindProto::Tcp6, "127.0.0.1:80").resolve();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[test]
    fn test_unix_bind_ephemeral() {
        let mut system = UnixSystem;
        let listener = system
            .bind(&BindSpec::new(BindProto::Tcp4, "127.0.0.1:0"))
            .unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_unix_lookup_root() {
        let mut system = UnixSystem;
        let ids = system.lookup_user("root").unwrap().unwrap();
        assert_eq!(ids, UserIds { uid: 0, gid: 0 });
        assert!(system
            .lookup_user("wfm-no-such-user-xyz")
            .unwrap()
            .is_none());
    }
}
