use std::io;

use quince_proto::{Host, ServerAddr};
use tokio::net::{self, TcpStream};
use tracing::debug;

/// Opens a TCP connection to `addr`
///
/// DNS names may resolve to multiple addresses, they are tried in order
/// until one accepts the connection. `TCP_NODELAY` is enabled since the
/// protocol layer already batches writes.
///
/// # Errors
///
/// Returns the error of the last attempted address, or an error if the name
/// didn't resolve to anything.
pub async fn connect_tcp(addr: &ServerAddr) -> io::Result<TcpStream> {
    let stream = match addr.host() {
        Host::Ip(ip) => TcpStream::connect((*ip, addr.port())).await?,
        Host::Dns(name) => {
            let mut last_err = None;
            let mut connected = None;
            for resolved in net::lookup_host((&**name, addr.port())).await? {
                match TcpStream::connect(resolved).await {
                    Ok(stream) => {
                        connected = Some(stream);
                        break;
                    }
                    Err(err) => {
                        debug!(%resolved, error = %err, "resolved address refused the connection");
                        last_err = Some(err);
                    }
                }
            }

            match (connected, last_err) {
                (Some(stream), _) => stream,
                (None, Some(err)) => return Err(err),
                (None, None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{name} did not resolve to any address"),
                    ))
                }
            }
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
