use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{ErrorResponseBody, Message};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use super::decoder::format_lsn;
use crate::config::ConnConfig;
use crate::{Error, Result};

/// Microseconds between the unix epoch and the postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// A connection in `replication=database` mode. Speaks the frontend/backend
/// protocol directly because the regular client has no CopyBoth support.
///
/// Only the replication monitor owns one of these.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    slot_name: String,
    publication: String,
    streaming: bool,
    received_lsn: u64,
    flushed_lsn: u64,
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: String,
    pub dbname: Option<String>,
}

/// A message received inside the CopyBoth stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData {
        wal_start: u64,
        wal_end: u64,
        timestamp: i64,
        data: Bytes,
    },
    Keepalive {
        wal_end: u64,
        timestamp: i64,
        reply: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_message("Empty replication message"));
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::invalid_message("Invalid XLogData message size"));
                }
                let wal_start = data.get_u64();
                let wal_end = data.get_u64();
                let timestamp = data.get_i64();
                Ok(ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    timestamp,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::invalid_message("Invalid keepalive message size"));
                }
                let wal_end = data.get_u64();
                let timestamp = data.get_i64();
                let reply = data.get_u8() != 0;
                Ok(ReplicationMessage::Keepalive {
                    wal_end,
                    timestamp,
                    reply,
                })
            }
            _ => Err(Error::invalid_message(format!(
                "Unknown replication message tag: {}",
                tag
            ))),
        }
    }
}

/// Encodes a standby status update ('r') for the given positions.
pub fn standby_status_update(received: u64, flushed: u64, timestamp: i64, reply: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(received);
    buf.put_u64(flushed);
    buf.put_u64(flushed);
    buf.put_i64(timestamp);
    buf.put_u8(u8::from(reply));
    buf.freeze()
}

/// Current time in postgres epoch microseconds.
pub fn pg_timestamp_now() -> i64 {
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

impl ReplicationConnection {
    pub async fn connect(conn: &ConnConfig, slot_name: String, publication: String) -> Result<Self> {
        info!(
            "Creating replication connection to {}:{}/{}",
            conn.host, conn.port, conn.database
        );

        let stream = tokio::time::timeout(
            conn.connect_timeout(),
            TcpStream::connect((conn.host.as_str(), conn.port)),
        )
        .await
        .map_err(|_| Error::Connection(format!("Timed out connecting to {}:{}", conn.host, conn.port)))??;
        stream.set_nodelay(true)?;

        let mut this = Self {
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            slot_name,
            publication,
            streaming: false,
            received_lsn: 0,
            flushed_lsn: 0,
        };

        let params = [
            ("user", conn.user.as_str()),
            ("database", conn.database.as_str()),
            ("replication", "database"),
            ("application_name", "pg-ledger-monitor"),
        ];
        frontend::startup_message(params.iter().copied(), &mut this.write_buf)?;
        this.flush().await?;
        this.authenticate(&conn.user, &conn.password).await?;
        this.wait_ready().await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(this)
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        loop {
            match self.next_message().await? {
                Message::AuthenticationOk => return Ok(()),
                Message::AuthenticationCleartextPassword => {
                    frontend::password_message(password.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hashed = authentication::md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                    frontend::password_message(hashed.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut supported = false;
                    let mut mechanisms = body.mechanisms();
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supported = true;
                        }
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "Server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    self.scram(password).await?;
                }
                Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(error_text(&body)));
                }
                _ => {
                    return Err(Error::Authentication(
                        "Unsupported authentication method".to_string(),
                    ))
                }
            }
        }
    }

    async fn scram(&mut self, password: &str) -> Result<()> {
        let mut scram = sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.next_message().await? {
            Message::AuthenticationSaslContinue(body) => {
                scram.update(body.data())?;
            }
            Message::ErrorResponse(body) => return Err(Error::Authentication(error_text(&body))),
            _ => return Err(Error::Authentication("Unexpected SASL message".to_string())),
        }
        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.next_message().await? {
            Message::AuthenticationSaslFinal(body) => {
                scram.finish(body.data())?;
                Ok(())
            }
            Message::ErrorResponse(body) => Err(Error::Authentication(error_text(&body))),
            _ => Err(Error::Authentication("Unexpected SASL message".to_string())),
        }
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.next_message().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ErrorResponse(body) => {
                    return Err(Error::Connection(error_text(&body)));
                }
                Message::ParameterStatus(_) | Message::BackendKeyData(_) | Message::NoticeResponse(_) => {}
                _ => {
                    return Err(Error::invalid_message("Unexpected message during startup"));
                }
            }
        }
    }

    /// Runs a replication command and returns its rows as text.
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        debug!("Sending replication command: {}", sql);
        frontend::query(sql, &mut self.write_buf)?;
        self.flush().await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            match self.next_message().await? {
                Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let mut row = Vec::new();
                    let mut ranges = body.ranges();
                    while let Some(range) = ranges.next()? {
                        row.push(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()));
                    }
                    rows.push(row);
                }
                Message::ErrorResponse(body) => {
                    error = Some(error_text(&body));
                }
                Message::ReadyForQuery(_) => break,
                Message::CommandComplete(body) => {
                    trace!("Command complete: {}", body.tag()?);
                }
                _ => {}
            }
        }

        match error {
            Some(message) => Err(Error::replication(message)),
            None => Ok(rows),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.into_iter().next().ok_or_else(|| Error::replication("Failed to get system info"))?;
        let mut fields = row.into_iter();
        let system_id = fields.next().flatten().unwrap_or_default();
        let timeline = fields
            .next()
            .flatten()
            .and_then(|t| t.parse::<i32>().ok())
            .unwrap_or(1);
        let xlogpos = fields.next().flatten().unwrap_or_else(|| "0/0".to_string());
        let dbname = fields.next().flatten();

        let info = SystemInfo {
            system_id,
            timeline,
            xlogpos,
            dbname,
        };
        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Creates a temporary slot, dropped by the server when this connection closes.
    pub async fn create_temporary_slot(&mut self) -> Result<String> {
        info!("Creating replication slot: {}", self.slot_name);
        let query = format!(
            "CREATE_REPLICATION_SLOT {} TEMPORARY LOGICAL pgoutput TWO_PHASE",
            quote_ident(&self.slot_name)
        );
        let rows = self.simple_query(&query).await?;
        let consistent_point = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().nth(1).flatten())
            .unwrap_or_else(|| "0/0".to_string());
        info!(
            "Created replication slot '{}' at LSN {}",
            self.slot_name, consistent_point
        );
        Ok(consistent_point)
    }

    pub async fn start_replication(&mut self, start_lsn: &str) -> Result<()> {
        info!("Starting replication from LSN: {}", start_lsn);

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '3', publication_names '{}', messages 'true')",
            quote_ident(&self.slot_name),
            start_lsn,
            self.publication.replace('\'', "''"),
        );
        frontend::query(&query, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            if self.take_copy_both_response()? {
                break;
            }
            if let Some(message) = Message::parse(&mut self.read_buf)? {
                match message {
                    Message::ErrorResponse(body) => {
                        return Err(Error::replication(error_text(&body)))
                    }
                    Message::NoticeResponse(_) => {}
                    _ => return Err(Error::invalid_message("Expected CopyBothResponse")),
                }
                continue;
            }
            self.fill().await?;
        }

        self.streaming = true;
        info!("Replication stream started on slot {}", self.slot_name);
        Ok(())
    }

    /// Receives the next replication message.
    ///
    /// Cancel safe: partially read frames stay buffered for the next call.
    pub async fn recv(&mut self) -> Result<ReplicationMessage> {
        if !self.streaming {
            return Err(Error::replication("Replication not started"));
        }

        loop {
            if let Some(message) = Message::parse(&mut self.read_buf)? {
                match message {
                    Message::CopyData(body) => {
                        let message = ReplicationMessage::parse(body.into_bytes())?;
                        match &message {
                            ReplicationMessage::XLogData { wal_end, .. }
                            | ReplicationMessage::Keepalive { wal_end, .. } => {
                                self.received_lsn = self.received_lsn.max(*wal_end);
                            }
                        }
                        return Ok(message);
                    }
                    Message::CopyDone => {
                        self.streaming = false;
                        return Err(Error::ReplicationInterrupted(
                            "Server ended the replication stream".to_string(),
                        ));
                    }
                    Message::ErrorResponse(body) => {
                        self.streaming = false;
                        return Err(Error::ReplicationInterrupted(error_text(&body)));
                    }
                    Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                    _ => {
                        return Err(Error::invalid_message("Unexpected message in replication stream"));
                    }
                }
                continue;
            }
            self.fill().await?;
        }
    }

    /// Marks WAL up to `lsn` as durably processed.
    pub fn confirm(&mut self, lsn: u64) {
        self.flushed_lsn = self.flushed_lsn.max(lsn);
    }

    pub async fn send_standby_status(&mut self, reply: bool) -> Result<()> {
        if !self.streaming {
            return Err(Error::replication("No active replication stream"));
        }
        let update = standby_status_update(
            self.received_lsn,
            self.flushed_lsn,
            pg_timestamp_now(),
            reply,
        );
        trace!(
            "Standby status update: received {} flushed {}",
            format_lsn(self.received_lsn),
            format_lsn(self.flushed_lsn)
        );
        frontend::CopyData::new(update)?.write(&mut self.write_buf);
        self.flush().await
    }

    pub async fn close(mut self) -> Result<()> {
        info!("Closing replication connection");
        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
        }
        frontend::terminate(&mut self.write_buf);
        if let Err(e) = self.flush().await {
            warn!("Failed to send terminate: {}", e);
        }
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Consumes a CopyBothResponse frame from the front of the buffer.
    fn take_copy_both_response(&mut self) -> Result<bool> {
        if self.read_buf.len() < 5 || self.read_buf[0] != COPY_BOTH_RESPONSE_TAG {
            return Ok(false);
        }
        let len = u32::from_be_bytes([
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
        ]) as usize;
        if self.read_buf.len() < len + 1 {
            return Ok(false);
        }
        self.read_buf.advance(len + 1);
        Ok(true)
    }

    async fn next_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = Message::parse(&mut self.read_buf)? {
                return Ok(message);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            self.streaming = false;
            return Err(Error::ReplicationInterrupted(
                "Replication connection closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let data = self.write_buf.split();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn error_text(body: &ErrorResponseBody) -> String {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    format!("{} {}: {}", severity, code, message)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
