use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{RespCommand, RespKind};

/// Read one replication-level frame. Bulk headers are returned after the
/// `$<n>` line only; the body stays in the reader so the caller can hand it
/// to the snapshot filter.
pub async fn read_command<R>(reader: &mut R) -> Result<RespCommand>
where
    R: AsyncBufRead + Unpin,
{
    let header = read_line(reader).await.context("failed to read command")?;

    // empty command
    if header == b"\n" || header == b"\r\n" {
        return Ok(RespCommand {
            raw: header,
            kind: RespKind::Empty,
        });
    }

    match header[0] {
        b'+' => {
            let reply = String::from_utf8_lossy(header[1..].trim_ascii()).into_owned();
            Ok(RespCommand {
                raw: header,
                kind: RespKind::Reply(reply),
            })
        }
        b'$' => {
            let size = parse_int(&header[1..]).context("unable to decode bulk size")?;
            Ok(RespCommand {
                raw: header,
                kind: RespKind::Bulk(size),
            })
        }
        b'*' => {
            let count = parse_int(&header[1..])
                .and_then(|count| Ok(usize::try_from(count)?))
                .context("unable to parse command length")?;

            let mut raw = header;
            let mut command = Vec::with_capacity(count);

            for _ in 0..count {
                let arg_header = read_line(reader).await.context("failed to read command")?;
                if arg_header.first() != Some(&b'$') {
                    bail!("failed to read command: expected bulk argument");
                }
                raw.extend_from_slice(&arg_header);

                let arg_size = parse_int(&arg_header[1..])
                    .and_then(|size| Ok(usize::try_from(size)?))
                    .context("unable to parse argument length")?;

                let mut argument = vec![0u8; arg_size];
                reader
                    .read_exact(&mut argument)
                    .await
                    .context("failed to read argument")?;
                raw.extend_from_slice(&argument);

                let trailer = read_line(reader).await.context("failed to read argument")?;
                raw.extend_from_slice(&trailer);

                command.push(argument);
            }

            Ok(RespCommand {
                raw,
                kind: RespKind::Command(command),
            })
        }
        // bare text line, treated as a single-token inline command
        _ => {
            let token = header.trim_ascii().to_vec();
            Ok(RespCommand {
                raw: header,
                kind: RespKind::Command(vec![token]),
            })
        }
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;

    if n == 0 || line.last() != Some(&b'\n') {
        bail!("unexpected end of stream");
    }

    Ok(line)
}

fn parse_int(data: &[u8]) -> Result<i64> {
    Ok(std::str::from_utf8(data.trim_ascii())?.parse::<i64>()?)
}
