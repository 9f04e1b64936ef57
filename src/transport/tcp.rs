//! KISS-over-TCP carrier, for software TNCs like Direwolf.

use tokio::net::TcpStream;

use crate::transport::Error;

pub async fn connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    tracing::info!(host, port, "connected to remote KISS TNC");
    Ok(stream)
}
