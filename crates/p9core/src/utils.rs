use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!address!port` string into its three parts.
pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    if split.next().is_some() {
        return None;
    }

    Some((proto, addr, port))
}

/// Resolve a `proto!address!port` string into the protocol and the address
/// handed to the socket layer.
///
/// `tcp!127.0.0.1!564` becomes `("tcp", "127.0.0.1:564")`. Unix sockets have
/// no port, so `unix!/tmp/sock!0` becomes `("unix", "/tmp/sock")`.
pub fn resolve_addr(arg: &str) -> Option<(&str, String)> {
    let (proto, addr, port) = parse_proto(arg)?;
    match proto {
        "unix" => Some((proto, addr.to_owned())),
        _ => Some((proto, format!("{}:{}", addr, port))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proto_accepts_three_parts() {
        assert_eq!(
            parse_proto("tcp!0.0.0.0!564"),
            Some(("tcp", "0.0.0.0", "564"))
        );
        assert_eq!(parse_proto("tcp!0.0.0.0"), None);
        assert_eq!(parse_proto("tcp!a!b!c"), None);
    }

    #[test]
    fn resolve_addr_per_protocol() {
        assert_eq!(
            resolve_addr("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1:564".to_owned()))
        );
        assert_eq!(
            resolve_addr("unix!/tmp/p9!0"),
            Some(("unix", "/tmp/p9".to_owned()))
        );
        assert_eq!(resolve_addr("/tmp/p9"), None);
    }
}
