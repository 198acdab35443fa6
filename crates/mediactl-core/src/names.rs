//! Bus interface naming.
//!
//! Every interface name is composed as `<prefix>.<role>.<identity>` and
//! sanitized to the bus-safe alphabet. Filter interfaces narrow a broadcast
//! interface to one peer by appending the peer identity; parsing the peer
//! back out is the exact inverse.

use mediactl_types::Error;

/// Fixed prefix of every composed interface name.
pub const INTERFACE_PREFIX: &str = "org.mediactl";

/// Broadcast interface all server-to-client update signals travel on.
pub const UPDATE_INTERFACE: &str = "org.mediactl.update";

/// Longest accepted raw name; longer input is truncated before sanitizing.
const MAX_NAME_LENGTH: usize = 255;

/// Placeholder for characters outside the bus-safe alphabet.
const PLACEHOLDER: char = 'x';

/// Which side of the protocol an identity-scoped interface belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Map a raw name onto the bus-safe alphabet.
///
/// Only `0-9`, `a-z`, `A-Z` and `.` survive; a leading dot is not allowed;
/// everything else becomes [`PLACEHOLDER`]. Deterministic, so the same raw
/// identity always produces the same interface name.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .take(MAX_NAME_LENGTH)
        .enumerate()
        .map(|(i, c)| match c {
            '0'..='9' | 'a'..='z' | 'A'..='Z' => c,
            '.' if i != 0 => c,
            _ => PLACEHOLDER,
        })
        .collect()
}

/// Identity of the calling process, derived from the executable name.
///
/// # Errors
///
/// `InvalidOperation` when the executable path cannot be resolved.
pub fn own_identity() -> Result<String, Error> {
    let exe = std::env::current_exe().map_err(|_| Error::InvalidOperation)?;
    let name = exe
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(Error::InvalidOperation)?;
    Ok(sanitize_name(name))
}

/// Compose `<prefix>.<role>.<identity>`, sanitized.
///
/// # Errors
///
/// `InvalidParameter` on an empty identity.
pub fn interface_name(role: Role, identity: &str) -> Result<String, Error> {
    if identity.is_empty() {
        return Err(Error::InvalidParameter);
    }
    Ok(sanitize_name(&format!(
        "{INTERFACE_PREFIX}.{}.{identity}",
        role.as_str()
    )))
}

/// Compose a per-peer filter interface: `<base>.<peer>`, sanitized.
///
/// # Errors
///
/// `InvalidParameter` when either part is empty.
pub fn filter_interface_name(base_interface: &str, peer: &str) -> Result<String, Error> {
    if base_interface.is_empty() || peer.is_empty() {
        return Err(Error::InvalidParameter);
    }
    Ok(sanitize_name(&format!("{base_interface}.{peer}")))
}

/// Recover the peer identity from a filter interface name.
///
/// Exact inverse of [`filter_interface_name`] for identities already in the
/// bus-safe alphabet: strip the base interface and the separating dot.
#[must_use]
pub fn peer_from_filter_name<'a>(base_interface: &str, filter_name: &'a str) -> Option<&'a str> {
    filter_name
        .strip_prefix(base_interface)?
        .strip_prefix('.')
        .filter(|peer| !peer.is_empty())
}
