//! Line-delimited JSON transport
//!
//! Reads one client message per line and writes one server message per line.
//! Used when the tool client runs this process as a child.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::handler::ConnectionHandler;
use super::protocol::ServerMessage;

/// Serve requests from `reader` until it reaches end of input
///
/// Every shell is closed once the input ends.
pub async fn serve_lines<R, W>(handler: &ConnectionHandler, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    write_message(&mut writer, &ServerMessage::welcome()).await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("Received line: {}", line);
        let response = handler.handle_text(line).await;
        write_message(&mut writer, &response).await?;
    }

    info!("Input closed, shutting down");
    handler.terminal().shutdown_all();
    Ok(())
}

/// Serve on the process's stdin and stdout
pub async fn serve_stdio(handler: &ConnectionHandler) -> anyhow::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve_lines(handler, stdin, tokio::io::stdout()).await
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &ServerMessage) -> anyhow::Result<()> {
    let mut json = message.to_json()?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
