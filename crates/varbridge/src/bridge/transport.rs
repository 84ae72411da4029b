//! Stream endpoints handed over by the launching process.
//!
//! The launcher passes two small non-negative integers naming already-open file
//! descriptors: one we read requests from, one we write responses to. They come from
//! the first two command-line tokens or, failing that, from `VARBRIDGE_FDS="<in>,<out>"`.

use std::io;

use serde::{Deserialize, Serialize};

pub const FDS_ENV: &str = "VARBRIDGE_FDS";

/// Inbound/outbound descriptor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub inbound: i32,
    pub outbound: i32,
}

fn parse_fd(token: &str) -> Option<i32> {
    token.trim().parse::<i32>().ok().filter(|fd| *fd >= 0)
}

impl Endpoints {
    pub fn parse(inbound: &str, outbound: &str) -> Option<Self> {
        Some(Self {
            inbound: parse_fd(inbound)?,
            outbound: parse_fd(outbound)?,
        })
    }

    /// Parse `"<in>,<out>"`.
    pub fn parse_pair(pair: &str) -> Option<Self> {
        let (inbound, outbound) = pair.split_once(',')?;
        Self::parse(inbound, outbound)
    }

    /// Endpoints from the first two positional tokens.
    pub fn from_args<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let inbound = args.next()?;
        let outbound = args.next()?;
        Self::parse(inbound.as_ref(), outbound.as_ref())
    }

    pub fn from_env() -> Option<Self> {
        std::env::var(FDS_ENV).ok().as_deref().and_then(Self::parse_pair)
    }

    /// Positional tokens first, then the environment. `None` means no session.
    pub fn resolve<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_args(args).or_else(Self::from_env)
    }

    /// Take ownership of both descriptors as async files.
    ///
    /// Each descriptor is checked to be open before ownership is taken. If both
    /// directions name the same descriptor, the outbound side gets a duplicate so the
    /// two files can be closed independently.
    #[cfg(unix)]
    pub fn open(self) -> io::Result<(tokio::fs::File, tokio::fs::File)> {
        use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

        use nix::fcntl::{FcntlArg, fcntl};
        use nix::unistd::dup;

        for fd in [self.inbound, self.outbound] {
            // SAFETY: the borrow only lives for the F_GETFD check. An fd that is not
            // open makes fcntl fail with EBADF rather than touching anything.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            fcntl(borrowed, FcntlArg::F_GETFD)
                .map_err(|e| io::Error::other(format!("fd {fd} is not open: {e}")))?;
        }

        // SAFETY: the launcher hands both descriptors to this process and nothing
        // else in it owns them; the check above confirmed they are open.
        let inbound = unsafe { OwnedFd::from_raw_fd(self.inbound) };
        let outbound = if self.outbound == self.inbound {
            dup(&inbound).map_err(|e| io::Error::other(format!("dup({}) failed: {e}", self.inbound)))?
        } else {
            // SAFETY: as above, and distinct from `inbound`.
            unsafe { OwnedFd::from_raw_fd(self.outbound) }
        };

        tracing::debug!(
            inbound = self.inbound,
            outbound = self.outbound,
            "Opened stream endpoints"
        );
        Ok((
            tokio::fs::File::from_std(std::fs::File::from(inbound)),
            tokio::fs::File::from_std(std::fs::File::from(outbound)),
        ))
    }

    #[cfg(not(unix))]
    pub fn open(self) -> io::Result<(tokio::fs::File, tokio::fs::File)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "descriptor endpoints need a unix platform",
        ))
    }
}
