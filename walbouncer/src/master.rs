//! Replication client side of the proxy: the connection to the primary.
//! Opens a frontend connection in replication mode, issues the replication
//! commands and classifies the CopyBoth traffic for the filter.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::{Buf, Bytes};
use pq_proto::framed::Framed;
use pq_proto::FeMessage;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use postgres_ffi::{TimeLineID, TimestampTz};
use utils::lsn::Lsn;

/// A message received from the primary while streaming.
#[derive(Debug)]
pub enum ReplMessage {
    /// A chunk of WAL ('w').
    WalData(WalDataMessage),
    /// Sender keepalive ('k').
    Keepalive(PrimaryKeepalive),
    /// The primary ended the COPY stream (CopyDone).
    EndOfWal,
}

#[derive(Debug)]
pub struct WalDataMessage {
    /// LSN of the first payload byte.
    pub data_start: Lsn,
    /// The primary's current WAL end.
    pub wal_end: Lsn,
    /// Primary's clock at send time, microseconds since 2000-01-01.
    pub send_time: TimestampTz,
    pub data: Bytes,
}

impl WalDataMessage {
    /// First page boundary at or after the payload start.
    pub fn next_page_boundary(&self) -> Lsn {
        self.data_start.page_lsn_ceil()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PrimaryKeepalive {
    pub wal_end: Lsn,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

/// Result of IDENTIFY_SYSTEM.
///
/// See the [postgres docs] for more details.
///
/// [postgres docs]: https://www.postgresql.org/docs/current/protocol-replication.html
#[derive(Debug)]
pub struct IdentifySystem {
    pub systemid: String,
    pub timeline: TimeLineID,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Connection to the primary, in replication mode.
pub struct MasterConnection {
    framed: Framed<TcpStream>,
    /// ParameterStatus values the primary reported, latest value wins.
    parameters: HashMap<String, String>,
}

impl MasterConnection {
    /// Connect and run the startup handshake. The primary must trust us:
    /// there is no password to offer.
    pub async fn connect(host: &str, port: u16, user: &str) -> anyhow::Result<MasterConnection> {
        info!(
            "connecting to the primary at {}:{} as {} (replication)",
            host, port, user
        );
        let socket = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to primary {host}:{port}"))?;
        socket.set_nodelay(true)?;

        let mut conn = MasterConnection {
            framed: Framed::new(socket),
            parameters: HashMap::new(),
        };
        conn.framed.write_startup_message([
            ("user", user),
            ("database", "replication"),
            ("replication", "true"),
            ("application_name", "walbouncer"),
        ]);
        conn.framed.flush().await?;

        // Authentication, then parameter reports up to ReadyForQuery.
        loop {
            let (tag, mut body) = conn.read_frame().await?;
            match tag {
                b'R' => match body.get_i32() {
                    0 => {} // AuthenticationOk
                    method => bail!(
                        "primary requests authentication method {}, only trust is supported",
                        method
                    ),
                },
                b'S' => {
                    let name = get_cstr_string(&mut body)?;
                    let value = get_cstr_string(&mut body)?;
                    trace!("primary parameter {} = {}", name, value);
                    conn.parameters.insert(name, value);
                }
                b'K' => {} // BackendKeyData; we never cancel
                b'N' => {} // NoticeResponse
                b'Z' => break,
                b'E' => bail!("primary refused connection: {}", error_message(&body)),
                tag => bail!("unexpected message '{}' during startup", tag as char),
            }
        }
        info!("connected to the primary");
        Ok(conn)
    }

    /// Last ParameterStatus value the primary reported for `name`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub async fn identify_system(&mut self) -> anyhow::Result<IdentifySystem> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().context("IDENTIFY_SYSTEM returned no rows")?;

        let get = |idx: usize| -> anyhow::Result<&str> {
            row.get(idx)
                .and_then(|v| v.as_deref())
                .with_context(|| format!("IDENTIFY_SYSTEM row is missing column {idx}"))
        };
        Ok(IdentifySystem {
            systemid: get(0)?.to_owned(),
            timeline: get(1)?.parse().context("bad timeline id")?,
            xlogpos: get(2)?.parse().map_err(|e| anyhow::anyhow!("bad xlogpos: {e:?}"))?,
            dbname: row.get(3).and_then(|v| v.clone()),
        })
    }

    /// Issue START_REPLICATION and consume the CopyBothResponse. The
    /// connection only carries CopyBoth traffic afterwards, until
    /// `end_streaming`.
    pub async fn start_streaming(
        &mut self,
        startpoint: Lsn,
        timeline: Option<TimeLineID>,
    ) -> anyhow::Result<()> {
        let query = match timeline {
            Some(tli) => format!("START_REPLICATION PHYSICAL {} TIMELINE {}", startpoint, tli),
            None => format!("START_REPLICATION PHYSICAL {}", startpoint),
        };
        info!("requesting upstream stream: {}", query);
        self.framed
            .write_fe_message(&FeMessage::Query(query.clone().into_bytes().into()))?;
        self.framed.flush().await?;

        let (tag, body) = self.read_frame().await?;
        match tag {
            b'W' => Ok(()), // CopyBothResponse
            b'E' => bail!("primary rejected {}: {}", query, error_message(&body)),
            tag => bail!(
                "expected CopyBothResponse to {}, got '{}'",
                query,
                tag as char
            ),
        }
    }

    /// Wait up to `wait` for the next streaming message. `Ok(None)` on
    /// timeout. A zero wait polls without blocking.
    pub async fn receive_wal_message(
        &mut self,
        wait: Duration,
    ) -> anyhow::Result<Option<ReplMessage>> {
        let frame = match timeout(wait, self.framed.read_raw_message()).await {
            Err(_elapsed) => return Ok(None),
            Ok(res) => res?,
        };
        let (tag, mut body) = match frame {
            Some(frame) => frame,
            None => bail!("primary closed the connection mid-stream"),
        };
        match tag {
            b'd' => {
                if body.is_empty() {
                    bail!("empty CopyData message from primary");
                }
                match body.get_u8() {
                    b'w' => {
                        if body.remaining() < 24 {
                            bail!("truncated XLogData header from primary");
                        }
                        let msg = WalDataMessage {
                            data_start: Lsn(body.get_u64()),
                            wal_end: Lsn(body.get_u64()),
                            send_time: body.get_i64(),
                            data: body,
                        };
                        trace!(
                            "received {} bytes of WAL at {} (wal_end {})",
                            msg.data.len(),
                            msg.data_start,
                            msg.wal_end
                        );
                        Ok(Some(ReplMessage::WalData(msg)))
                    }
                    b'k' => {
                        if body.remaining() < 17 {
                            bail!("truncated keepalive from primary");
                        }
                        let ka = PrimaryKeepalive {
                            wal_end: Lsn(body.get_u64()),
                            send_time: body.get_i64(),
                            reply_requested: body.get_u8() != 0,
                        };
                        trace!("received keepalive {:?}", ka);
                        Ok(Some(ReplMessage::Keepalive(ka)))
                    }
                    sub => bail!("unknown CopyData sub-message '{}' from primary", sub as char),
                }
            }
            b'c' => {
                debug!("primary finished the WAL stream");
                Ok(Some(ReplMessage::EndOfWal))
            }
            b'E' => bail!("primary error mid-stream: {}", error_message(&body)),
            tag => bail!("unexpected message '{}' while streaming", tag as char),
        }
    }

    /// Forward a standby reply (status update or hot-standby feedback) to
    /// the primary as CopyData.
    pub async fn send_copy_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.framed
            .write_fe_message(&FeMessage::CopyData(Bytes::copy_from_slice(data)))?;
        self.framed.flush().await?;
        Ok(())
    }

    /// Leave COPY mode: send CopyDone, drain the stream to ReadyForQuery.
    /// Returns the next timeline id if the stream ended on a timeline
    /// switch, 0 otherwise.
    pub async fn end_streaming(&mut self) -> anyhow::Result<TimeLineID> {
        debug!("ending upstream streaming");
        self.framed.write_fe_message(&FeMessage::CopyDone)?;
        self.framed.flush().await?;

        let mut next_tli: TimeLineID = 0;
        let mut row_pending = false;
        loop {
            let (tag, mut body) = self.read_frame().await?;
            match tag {
                b'd' => {} // residual WAL or keepalives, already irrelevant
                b'c' => {} // the primary's own CopyDone
                b'C' => {} // CommandComplete
                b'T' => row_pending = true,
                b'D' if row_pending => {
                    // one row: next_tli int8, next_tli_startpos text
                    let ncols = body.get_i16();
                    if ncols >= 1 {
                        let len = body.get_i32();
                        if len > 0 {
                            let raw = body.split_to(len as usize);
                            let text = std::str::from_utf8(&raw)
                                .context("non-UTF8 timeline in end-of-stream result")?;
                            next_tli = text.parse().context("bad next timeline id")?;
                        }
                    }
                }
                b'S' => {
                    let name = get_cstr_string(&mut body)?;
                    let value = get_cstr_string(&mut body)?;
                    self.parameters.insert(name, value);
                }
                b'N' => {}
                b'Z' => break,
                b'E' => bail!("primary error while ending stream: {}", error_message(&body)),
                tag => bail!("unexpected message '{}' while ending stream", tag as char),
            }
        }
        Ok(next_tli)
    }

    /// Run one simple-protocol query and collect the DataRow values.
    async fn simple_query(&mut self, query: &str) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        debug!("upstream query: {}", query);
        self.framed
            .write_fe_message(&FeMessage::Query(Bytes::copy_from_slice(query.as_bytes())))?;
        self.framed.flush().await?;

        let mut rows = Vec::new();
        loop {
            let (tag, mut body) = self.read_frame().await?;
            match tag {
                b'T' => {} // RowDescription; values come back as text anyway
                b'D' => {
                    let ncols = body.get_i16();
                    let mut row = Vec::with_capacity(ncols as usize);
                    for _ in 0..ncols {
                        let len = body.get_i32();
                        if len < 0 {
                            row.push(None);
                        } else {
                            let raw = body.split_to(len as usize);
                            row.push(Some(
                                std::str::from_utf8(&raw)
                                    .context("non-UTF8 value in query result")?
                                    .to_owned(),
                            ));
                        }
                    }
                    rows.push(row);
                }
                b'C' | b'I' | b'N' => {}
                b'S' => {
                    let name = get_cstr_string(&mut body)?;
                    let value = get_cstr_string(&mut body)?;
                    self.parameters.insert(name, value);
                }
                b'Z' => break,
                b'E' => bail!("upstream query '{}' failed: {}", query, error_message(&body)),
                tag => bail!("unexpected message '{}' in query response", tag as char),
            }
        }
        Ok(rows)
    }

    async fn read_frame(&mut self) -> anyhow::Result<(u8, Bytes)> {
        self.framed
            .read_raw_message()
            .await?
            .context("primary closed the connection")
    }
}

fn get_cstr_string(body: &mut Bytes) -> anyhow::Result<String> {
    let pos = body
        .iter()
        .position(|b| *b == 0)
        .context("missing null terminator")?;
    let raw = body.split_to(pos);
    body.advance(1);
    Ok(String::from_utf8(raw.to_vec()).context("non-UTF8 string")?)
}

/// Pull the human-readable message out of an ErrorResponse body.
fn error_message(body: &Bytes) -> String {
    let mut body = body.clone();
    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let pos = match body.iter().position(|b| *b == 0) {
            Some(pos) => pos,
            None => break,
        };
        let value = body.split_to(pos);
        body.advance(1);
        if field == b'M' {
            return String::from_utf8_lossy(&value).into_owned();
        }
    }
    "unknown error".to_owned()
}
