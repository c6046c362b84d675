use std::net::TcpListener;

use anyhow::Context;

/// Asks the OS for a free ephemeral TCP port on loopback.
///
/// The probe listener is closed before returning, so a different process may
/// still grab the port before the server binds it; the readiness probe catches
/// that case.
pub fn allocate_local_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("bind ephemeral port")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_free_to_bind() {
        let port = allocate_local_port().unwrap();
        assert_ne!(port, 0);
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }
}
