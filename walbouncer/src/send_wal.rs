//! The streaming half of a standby session: runs the CopyBoth sub-protocol
//! after START_REPLICATION, pumping filtered WAL downstream and standby
//! feedback upstream.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_backend::{CopyStreamHandlerEnd, PostgresBackend, QueryError};
use postgres_ffi::xlog_utils::get_current_timestamp;
use postgres_ffi::{Oid, TimeLineID, TimestampTz};
use pq_proto::{BeMessage, FeMessage, WalSndKeepAlive, XLogDataBody};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace};
use utils::lsn::Lsn;

use crate::filter::{ProcessResult, WalFilter};
use crate::master::{MasterConnection, ReplMessage, WalDataMessage};

/// How long one wait on the primary may take before the standby gets
/// another chance to talk to us.
pub const NAPTIME: Duration = Duration::from_millis(100);

// See: https://www.postgresql.org/docs/current/protocol-replication.html
const STANDBY_STATUS_UPDATE_TAG_BYTE: u8 = b'r';
const HOT_STANDBY_FEEDBACK_TAG_BYTE: u8 = b'h';

/// Standby status update, the 'r' reply.
#[derive(Debug, Clone, Copy)]
pub struct StandbyReply {
    pub write_lsn: Lsn, // The location of the last WAL byte + 1 received and written to disk in the standby.
    pub flush_lsn: Lsn, // The location of the last WAL byte + 1 flushed to disk in the standby.
    pub apply_lsn: Lsn, // The location of the last WAL byte + 1 applied in the standby.
    pub reply_ts: TimestampTz,
    pub reply_requested: bool,
}

impl StandbyReply {
    /// The caller already consumed the tag byte.
    fn parse(buf: &mut Bytes) -> anyhow::Result<StandbyReply> {
        if buf.remaining() < 33 {
            anyhow::bail!("truncated standby status update");
        }
        Ok(StandbyReply {
            write_lsn: Lsn(buf.get_u64()),
            flush_lsn: Lsn(buf.get_u64()),
            apply_lsn: Lsn(buf.get_u64()),
            reply_ts: buf.get_i64(),
            reply_requested: buf.get_u8() != 0,
        })
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(STANDBY_STATUS_UPDATE_TAG_BYTE);
        buf.put_u64(self.write_lsn.0);
        buf.put_u64(self.flush_lsn.0);
        buf.put_u64(self.apply_lsn.0);
        buf.put_i64(self.reply_ts);
        buf.put_u8(0); // never ask the primary for an answer on the standby's behalf
    }
}

/// Hot standby feedback, the 'h' reply.
#[derive(Debug, Clone, Copy)]
pub struct HotStandbyFeedback {
    pub ts: TimestampTz,
    pub xmin: u32,
    pub epoch: u32,
}

impl HotStandbyFeedback {
    fn parse(buf: &mut Bytes) -> anyhow::Result<HotStandbyFeedback> {
        if buf.remaining() < 16 {
            anyhow::bail!("truncated hot standby feedback");
        }
        Ok(HotStandbyFeedback {
            ts: buf.get_i64(),
            xmin: buf.get_u32(),
            epoch: buf.get_u32(),
        })
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(HOT_STANDBY_FEEDBACK_TAG_BYTE);
        buf.put_i64(self.ts);
        buf.put_u32(self.xmin);
        buf.put_u32(self.epoch);
    }
}

/// Mutable state of one streaming session.
struct StreamingState {
    /// End of the last WAL chunk forwarded to the standby.
    sent_ptr: Lsn,
    last_send_time: TimestampTz,
    copy_done_sent: bool,
    copy_done_received: bool,
    /// Latest feedback from the standby, forwarded to the primary on its
    /// next keepalive.
    standby_reply: Option<StandbyReply>,
    hs_feedback: Option<HotStandbyFeedback>,
}

impl StreamingState {
    fn new(startpoint: Lsn) -> StreamingState {
        StreamingState {
            sent_ptr: startpoint,
            last_send_time: 0,
            copy_done_sent: false,
            copy_done_received: false,
            standby_reply: None,
            hs_feedback: None,
        }
    }
}

/// Serve START_REPLICATION PHYSICAL: stream until the primary runs out of
/// WAL or the standby hangs up. Ends the command with CommandComplete when
/// the stream finished cleanly.
pub async fn handle_start_replication<IO: AsyncRead + AsyncWrite + Unpin + Send>(
    pgb: &mut PostgresBackend<IO>,
    master: &mut MasterConnection,
    startpoint: Lsn,
    timeline: Option<TimeLineID>,
    include_tablespaces: Option<HashSet<Oid>>,
) -> Result<(), QueryError> {
    match handle_start_replication_guts(pgb, master, startpoint, timeline, include_tablespaces)
        .await
    {
        Ok(()) => {
            // back to the command loop; the caller's loop follows up with
            // ReadyForQuery
            pgb.write_message_noflush(&BeMessage::CommandComplete(b"SELECT"))?;
            Ok(())
        }
        Err(end) => {
            pgb.handle_copy_stream_end(end).await;
            Ok(())
        }
    }
}

async fn handle_start_replication_guts<IO: AsyncRead + AsyncWrite + Unpin + Send>(
    pgb: &mut PostgresBackend<IO>,
    master: &mut MasterConnection,
    startpoint: Lsn,
    timeline: Option<TimeLineID>,
    include_tablespaces: Option<HashSet<Oid>>,
) -> Result<(), CopyStreamHandlerEnd> {
    info!(
        "starting streaming to standby from {}, tablespace filter: {:?}",
        startpoint, include_tablespaces
    );

    let mut filter = WalFilter::new(startpoint, include_tablespaces);
    let mut state = StreamingState::new(startpoint);
    let mut startpos = startpoint;
    let mut copy_both_sent = false;

    'streaming: loop {
        master.start_streaming(startpos, timeline).await?;
        if !copy_both_sent {
            pgb.write_message(&BeMessage::CopyBothResponse).await?;
            copy_both_sent = true;
        }

        loop {
            process_standby_replies(pgb, master, &mut state).await?;
            pgb.flush().await?;

            if state.copy_done_sent && state.copy_done_received {
                break 'streaming;
            }

            let mut msg = match master.receive_wal_message(NAPTIME).await? {
                Some(msg) => msg,
                None => continue, // timeout: check on the standby again
            };
            loop {
                match msg {
                    ReplMessage::EndOfWal => break 'streaming,
                    ReplMessage::WalData(ref wal) => {
                        match filter.process_message(wal.data_start, &wal.data)? {
                            ProcessResult::Continue => {
                                send_wal_block(pgb, wal, &filter, &mut state).await?;
                            }
                            ProcessResult::Restart(restart_pos) => {
                                let next_tli = master.end_streaming().await?;
                                if next_tli != 0 {
                                    return Err(CopyStreamHandlerEnd::Other(anyhow!(
                                        "primary switched to timeline {} during resync",
                                        next_tli
                                    )));
                                }
                                startpos = restart_pos;
                                continue 'streaming;
                            }
                        }
                    }
                    ReplMessage::Keepalive(ka) => {
                        trace!("primary keepalive: {:?}", ka);
                        forward_feedback(master, &state).await?;
                    }
                }
                // drain whatever else already arrived before sleeping again
                msg = match master.receive_wal_message(Duration::ZERO).await? {
                    Some(msg) => msg,
                    None => break,
                };
            }
        }
    }

    let next_tli = master.end_streaming().await?;
    if next_tli != 0 {
        info!("upstream WAL ends with a switch to timeline {}", next_tli);
    }
    if !state.copy_done_sent {
        pgb.write_message_noflush(&BeMessage::CopyDone)?;
        state.copy_done_sent = true;
    }
    pgb.flush().await?;
    info!("streaming finished at {}", state.sent_ptr);
    Ok(())
}

/// Forward one filtered WAL chunk, compensating the envelope for bytes the
/// filter is withholding: dataStart backs up over previously withheld bytes
/// now being released, walEnd retreats over bytes withheld at the tail.
async fn send_wal_block<IO: AsyncRead + AsyncWrite + Unpin + Send>(
    pgb: &mut PostgresBackend<IO>,
    wal: &WalDataMessage,
    filter: &WalFilter,
    state: &mut StreamingState,
) -> Result<(), CopyStreamHandlerEnd> {
    if !filter.synchronized() || filter.output().is_empty() {
        // data not sent now will be seen again after the restart
        return Ok(());
    }

    let data_start = filter.output_start();
    let wal_end = wal.wal_end.saturating_sub(filter.held_bytes() as u64);
    pgb.write_message_noflush(&BeMessage::XLogData(XLogDataBody {
        wal_start: data_start.0,
        wal_end: wal_end.0,
        timestamp: wal.send_time,
        data: filter.output(),
    }))?;
    pgb.flush().await?;

    state.sent_ptr = data_start + filter.output().len() as u64;
    state.last_send_time = wal.send_time;
    trace!(
        "sent {} bytes of WAL {}-{}",
        filter.output().len(),
        data_start,
        state.sent_ptr
    );
    Ok(())
}

/// Drain all replies the standby has already sent, without blocking.
async fn process_standby_replies<IO: AsyncRead + AsyncWrite + Unpin + Send>(
    pgb: &mut PostgresBackend<IO>,
    master: &mut MasterConnection,
    state: &mut StreamingState,
) -> Result<(), CopyStreamHandlerEnd> {
    loop {
        let msg = match pgb.read_message_if_ready().await? {
            Some(msg) => msg,
            None => return Ok(()),
        };
        if state.copy_done_received && !matches!(msg, FeMessage::Terminate) {
            return Err(CopyStreamHandlerEnd::Other(anyhow!(
                "unexpected standby message {:?} after CopyDone",
                msg
            )));
        }
        match msg {
            FeMessage::CopyData(body) => {
                process_standby_reply_message(pgb, master, state, body).await?;
            }
            FeMessage::CopyDone => {
                debug!("standby sent CopyDone");
                if !state.copy_done_sent {
                    pgb.write_message_noflush(&BeMessage::CopyDone)?;
                    state.copy_done_sent = true;
                }
                state.copy_done_received = true;
            }
            FeMessage::Terminate => {
                return Err(CopyStreamHandlerEnd::Other(anyhow!(
                    "standby closed the session mid-stream"
                )));
            }
            other => {
                return Err(CopyStreamHandlerEnd::Other(anyhow!(
                    "unexpected standby message {:?} during streaming",
                    other
                )));
            }
        }
    }
}

async fn process_standby_reply_message<IO: AsyncRead + AsyncWrite + Unpin + Send>(
    pgb: &mut PostgresBackend<IO>,
    master: &mut MasterConnection,
    state: &mut StreamingState,
    mut body: Bytes,
) -> Result<(), CopyStreamHandlerEnd> {
    if body.is_empty() {
        return Err(CopyStreamHandlerEnd::Other(anyhow!(
            "empty CopyData reply from standby"
        )));
    }
    match body.get_u8() {
        STANDBY_STATUS_UPDATE_TAG_BYTE => {
            let reply = StandbyReply::parse(&mut body)?;
            trace!(
                "standby status: write {} flush {} apply {}{}",
                reply.write_lsn,
                reply.flush_lsn,
                reply.apply_lsn,
                if reply.reply_requested {
                    " (reply requested)"
                } else {
                    ""
                }
            );
            state.standby_reply = Some(reply);
            if reply.reply_requested {
                send_keepalive(pgb, state, false).await?;
            }
        }
        HOT_STANDBY_FEEDBACK_TAG_BYTE => {
            let feedback = HotStandbyFeedback::parse(&mut body)?;
            trace!(
                "hot standby feedback: xmin {} epoch {}",
                feedback.xmin,
                feedback.epoch
            );
            state.hs_feedback = Some(feedback);
            // Pass it along right away; xmin holds back vacuum on the
            // primary and should not wait for the next keepalive.
            forward_feedback(master, state).await?;
        }
        tag => {
            return Err(CopyStreamHandlerEnd::Other(anyhow!(
                "unexpected standby reply type '{}'",
                tag as char
            )));
        }
    }
    Ok(())
}

/// Send the most recent standby positions and hot-standby feedback to the
/// primary.
async fn forward_feedback(
    master: &mut MasterConnection,
    state: &StreamingState,
) -> Result<(), CopyStreamHandlerEnd> {
    let mut buf = BytesMut::with_capacity(64);
    if let Some(reply) = &state.standby_reply {
        reply.serialize(&mut buf);
        master.send_copy_data(&buf).await?;
        buf.clear();
    }
    if let Some(feedback) = &state.hs_feedback {
        feedback.serialize(&mut buf);
        master.send_copy_data(&buf).await?;
    }
    Ok(())
}

/// Keepalive to the standby: 'k', our send pointer, last send time, and
/// whether we want an answer.
async fn send_keepalive<IO: AsyncRead + AsyncWrite + Unpin + Send>(
    pgb: &mut PostgresBackend<IO>,
    state: &StreamingState,
    request_reply: bool,
) -> Result<(), CopyStreamHandlerEnd> {
    debug!(
        "sending keepalive {}{}",
        state.sent_ptr,
        if request_reply { " (reply requested)" } else { "" }
    );
    pgb.write_message(&BeMessage::KeepAlive(WalSndKeepAlive {
        wal_end: state.sent_ptr.0,
        timestamp: if state.last_send_time != 0 {
            state.last_send_time
        } else {
            get_current_timestamp()
        },
        request_reply,
    }))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standby_reply_roundtrip() {
        let reply = StandbyReply {
            write_lsn: Lsn(0x1500100),
            flush_lsn: Lsn(0x1500080),
            apply_lsn: Lsn(0x1500000),
            reply_ts: 700000000123456,
            reply_requested: true,
        };
        let mut buf = BytesMut::new();
        reply.serialize(&mut buf);
        assert_eq!(buf.len(), 34);
        let mut bytes = buf.freeze();
        assert_eq!(bytes.get_u8(), STANDBY_STATUS_UPDATE_TAG_BYTE);
        let parsed = StandbyReply::parse(&mut bytes).unwrap();
        assert_eq!(parsed.write_lsn, reply.write_lsn);
        assert_eq!(parsed.flush_lsn, reply.flush_lsn);
        assert_eq!(parsed.apply_lsn, reply.apply_lsn);
        assert_eq!(parsed.reply_ts, reply.reply_ts);
        // forwarded updates never demand a reply from the primary
        assert!(!parsed.reply_requested);
    }

    #[test]
    fn hot_standby_feedback_roundtrip() {
        let feedback = HotStandbyFeedback {
            ts: 700000000123456,
            xmin: 12345,
            epoch: 2,
        };
        let mut buf = BytesMut::new();
        feedback.serialize(&mut buf);
        assert_eq!(buf.len(), 17);
        let mut bytes = buf.freeze();
        assert_eq!(bytes.get_u8(), HOT_STANDBY_FEEDBACK_TAG_BYTE);
        let parsed = HotStandbyFeedback::parse(&mut bytes).unwrap();
        assert_eq!(parsed.xmin, feedback.xmin);
        assert_eq!(parsed.epoch, feedback.epoch);
        assert_eq!(parsed.ts, feedback.ts);
    }

    #[test]
    fn truncated_replies_are_rejected() {
        let mut short = Bytes::from_static(&[0u8; 10]);
        StandbyReply::parse(&mut short).unwrap_err();
        let mut short = Bytes::from_static(&[0u8; 3]);
        HotStandbyFeedback::parse(&mut short).unwrap_err();
    }
}
