use mysql_common::constants::CapabilityFlags;

pub mod authenticator;

/// Capability mask the proxy advertises to the client: what the backend
/// offers, clipped to what the proxy will carry, with the SSL bit injected
/// when the listener terminates TLS. Nothing outside `proxy_allowed` ever
/// reaches the client.
pub fn advertise_to_client(
    backend_advertised: CapabilityFlags,
    proxy_allowed: CapabilityFlags,
    frontend_tls: bool,
) -> CapabilityFlags {
    let mut advertised = backend_advertised & proxy_allowed;
    if frontend_tls {
        advertised |= CapabilityFlags::CLIENT_SSL;
    }
    advertised
}

/// Capability mask forwarded to the backend: what the client chose, clipped
/// to the backend's advertisement and the proxy's own allowance, with the
/// SSL bit forced according to the backend TLS policy rather than inherited
/// from the client.
pub fn forward_to_backend(
    client_chosen: CapabilityFlags,
    backend_advertised: CapabilityFlags,
    proxy_allowed: CapabilityFlags,
    backend_tls: bool,
) -> CapabilityFlags {
    let mut forwarded = client_chosen & backend_advertised & proxy_allowed;
    if backend_tls {
        forwarded |= CapabilityFlags::CLIENT_SSL;
    } else {
        forwarded &= !CapabilityFlags::CLIENT_SSL;
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::default_capabilities;

    #[test]
    fn test_advertise_masks_unsupported_bits() {
        let backend = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_COMPRESS
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;
        let advertised = advertise_to_client(backend, default_capabilities(), false);
        // compression never crosses the proxy
        assert!(!advertised.contains(CapabilityFlags::CLIENT_COMPRESS));
        assert!(advertised.contains(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(advertised.contains(CapabilityFlags::CLIENT_LOCAL_FILES));
        assert!(!advertised.contains(CapabilityFlags::CLIENT_SSL));
    }

    #[test]
    fn test_advertise_adds_ssl_with_frontend_tls() {
        let backend = CapabilityFlags::CLIENT_PROTOCOL_41;
        let advertised = advertise_to_client(backend, default_capabilities(), true);
        assert!(advertised.contains(CapabilityFlags::CLIENT_SSL));
    }

    #[test]
    fn test_forward_is_intersection_with_forced_tls_bit() {
        let client = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SSL
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS;
        let backend = CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_SSL;
        let forwarded = forward_to_backend(client, backend, default_capabilities(), false);
        // client-side TLS does not imply backend-side TLS
        assert!(!forwarded.contains(CapabilityFlags::CLIENT_SSL));
        assert!(forwarded.contains(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(!forwarded.contains(CapabilityFlags::CLIENT_MULTI_STATEMENTS));

        let forwarded = forward_to_backend(client, backend, default_capabilities(), true);
        assert!(forwarded.contains(CapabilityFlags::CLIENT_SSL));
    }
}
