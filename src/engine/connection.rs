use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::parser::read_command;
use super::{ProxyConfig, RespKind, BUF_SIZE, CHANNEL_BUFFER};
use crate::rdb::{filter_rdb, Chunk};

/// Drives one accepted slave connection: owns the slave's read side, spawns
/// the writer and master-side tasks, and forwards the handshake commands the
/// replication protocol needs. Anything else is answered with an error.
pub async fn handle_slave(config: Arc<ProxyConfig>, stream: TcpStream) {
    match stream.peer_addr() {
        Ok(addr) => info!("slave connection established from {}", addr),
        Err(_) => info!("slave connection established"),
    }

    let (read_half, write_half) = stream.into_split();

    // channel for writing to slave
    let (slave_tx, slave_rx) = mpsc::channel::<Chunk>(CHANNEL_BUFFER);
    // channel for writing to master
    let (master_tx, master_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);

    tokio::spawn(slave_writer(write_half, slave_rx));
    tokio::spawn(master_connection(config, slave_tx.clone(), master_rx));

    let mut reader = BufReader::with_capacity(BUF_SIZE, read_half);

    loop {
        let command = match read_command(&mut reader).await {
            Ok(command) => command,
            Err(err) => {
                error!("error while reading from slave: {:#}", err);
                return;
            }
        };

        let forward = match &command.kind {
            // passthrough reply & empty command
            RespKind::Reply(_) | RespKind::Empty | RespKind::Bulk(0) => true,
            RespKind::Command(args) if args.len() == 1 && args[0] == b"PING" => {
                info!("got PING from slave");
                true
            }
            RespKind::Command(args) if args.len() == 1 && args[0] == b"SYNC" => {
                info!("starting SYNC");
                true
            }
            RespKind::Command(args)
                if args.len() == 3 && args[0] == b"REPLCONF" && args[1] == b"ACK" =>
            {
                info!("got ACK from slave");
                true
            }
            _ => false,
        };

        if forward {
            if master_tx.send(command.raw).await.is_err() {
                return;
            }
        } else if slave_tx
            .send(Some(b"+ERR unknown command\r\n".to_vec()))
            .await
            .is_err()
            || slave_tx.send(None).await.is_err()
        {
            return;
        }
    }
}

/// Connects to the master, relays its replies to the slave and runs the
/// snapshot filter over the RDB bulk when the full resync starts.
async fn master_connection(
    config: Arc<ProxyConfig>,
    slave_tx: mpsc::Sender<Chunk>,
    master_rx: mpsc::Receiver<Vec<u8>>,
) {
    let address = format!("{}:{}", config.master_host, config.master_port);

    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to connect to master at {}: {}", address, err);
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(master_writer(write_half, master_rx));

    let mut reader = BufReader::with_capacity(BUF_SIZE, read_half);

    loop {
        let command = match read_command(&mut reader).await {
            Ok(command) => command,
            Err(err) => {
                error!("error while reading from master: {:#}", err);
                return;
            }
        };

        match command.kind {
            RespKind::Command(ref args) if args.len() == 1 && args[0] == b"PING" => {
                info!("got PING from master");
                if forward_and_flush(&slave_tx, command.raw).await.is_err() {
                    return;
                }
            }
            RespKind::Bulk(size) if size > 0 => {
                // RDB transfer: the header goes through verbatim, the body
                // goes through the filter
                info!("RDB size: {}", size);

                if slave_tx.send(Some(command.raw)).await.is_err() {
                    return;
                }

                let filter = filter_rdb(
                    &mut reader,
                    slave_tx.clone(),
                    |key| config.key_pattern.is_match(key),
                    size,
                );
                if let Err(err) = filter.await {
                    error!("unable to read RDB: {}", err);
                    return;
                }

                info!("RDB filtering finished, filtering commands...");
            }
            RespKind::Command(ref args) => {
                // conventionally the second argument is the key
                if args.len() >= 2 && !config.key_pattern.is_match(&args[1]) {
                    continue;
                }
                if forward_and_flush(&slave_tx, command.raw).await.is_err() {
                    return;
                }
            }
            // passthrough reply, empty command and null bulk headers
            _ => {
                if forward_and_flush(&slave_tx, command.raw).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn forward_and_flush(
    slave_tx: &mpsc::Sender<Chunk>,
    raw: Vec<u8>,
) -> Result<(), mpsc::error::SendError<Chunk>> {
    slave_tx.send(Some(raw)).await?;
    slave_tx.send(None).await
}

/// Drains the slave-bound queue into a buffered writer; a `None` chunk is
/// the flush marker.
async fn slave_writer(conn: OwnedWriteHalf, mut slave_rx: mpsc::Receiver<Chunk>) {
    let mut writer = BufWriter::with_capacity(BUF_SIZE, conn);

    while let Some(chunk) = slave_rx.recv().await {
        let result = match chunk {
            Some(data) => writer.write_all(&data).await,
            None => writer.flush().await,
        };

        if let Err(err) = result {
            error!("failed to write data to slave: {}", err);
            return;
        }
    }
}

async fn master_writer(mut conn: OwnedWriteHalf, mut master_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = master_rx.recv().await {
        if let Err(err) = conn.write_all(&data).await {
            error!("failed to write data to master: {}", err);
            return;
        }
    }
}
