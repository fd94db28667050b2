//! The WAL filter: parses page and record structure of the upstream byte
//! stream and decides, record by record, what the standby gets to see.
//!
//! Records whose every block reference lands in an included tablespace pass
//! through byte-for-byte. Records touching excluded tablespaces are
//! rewritten in place as RM_XLOG/NOOP records of the same length, so LSN
//! arithmetic, record alignment and page layout downstream stay identical
//! to the primary's.
//!
//! A record can only be classified once its header and block references are
//! in hand, and those can straddle page and message boundaries. Undecided
//! bytes are therefore withheld from the output and carried in `buffer`
//! until the verdict; the enclosing session later compensates the reported
//! dataStart/walEnd for the carried bytes.

use std::collections::HashSet;

use anyhow::bail;
use bytes::BytesMut;
use postgres_ffi::pg_constants::XLP_FIRST_IS_CONTRECORD;
use postgres_ffi::walrecord::{scan_rel_file_nodes, BlockRefScan};
use postgres_ffi::xlog_utils::{
    encode_noop_record, page_header_size_at, validate_long_page_header, validate_page_header,
    XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_RECORD,
};
use postgres_ffi::{
    Oid, RelFileNode, XLogLongPageHeaderData, XLogPageHeaderData, XLogRecord, WAL_SEGMENT_SIZE,
    XLOG_BLCKSZ,
};
use tracing::{debug, trace, warn};
use utils::lsn::Lsn;

/// Cap on bytes withheld while a record's verdict is pending. In practice
/// the undecidable prefix of a record is its header plus the block
/// references, well under a page; hitting the cap means the stream is not
/// what we think it is and we resync by restarting.
pub const FL_BUFFER_LEN: usize = 8192;

/// Where the filter is in the WAL byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// At a page boundary, consuming the page header.
    ScanHeader,
    /// In the record area: at a record boundary, or passing through the
    /// body of a record that was kept.
    ScanRecord,
    /// A record header is split across message boundaries; waiting for the
    /// rest of it.
    BufferRecord,
    /// The header is in hand but the block references (and the tablespace
    /// oids in them) are not complete yet.
    BufferFilenode,
    /// Overwriting the body of a filtered-out record with the NOOP image.
    SkipRecord,
    /// Consuming bytes that can't be interpreted (mid-page start, or a
    /// continuation of a record whose beginning we never saw) up to
    /// `skip_until`, emitting nothing.
    SkipToPage,
}

/// What the caller must do after feeding a message.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Output (possibly empty) is ready; keep streaming.
    Continue,
    /// The filter lost track of record alignment; end the upstream stream
    /// and restart it at the returned LSN.
    Restart(Lsn),
}

pub struct WalFilter {
    state: FilterState,
    /// LSN the standby asked to start from; nothing below it is emitted.
    requested_start_pos: Lsn,
    /// LSN of the next upstream byte to classify.
    current_pos: Lsn,
    /// Tablespaces to keep; `None` keeps everything.
    include_tablespaces: Option<HashSet<Oid>>,
    /// Has a record boundary been located since (re)start?
    synchronized: bool,
    /// First LSN emission is allowed from. Bumped on synchronization and on
    /// restarts so re-received bytes are not sent twice.
    emit_from: Lsn,

    /// Raw withheld bytes `[buffer_start, current_pos)`: the prefix of a
    /// record (plus any page header embedded in it) that can't be emitted
    /// until the record is classified. Carries across messages.
    buffer: Vec<u8>,
    buffer_start: Lsn,
    /// The logical bytes of the record under classification: `buffer` minus
    /// page headers. This is what the block-reference scan runs on.
    assembly: Vec<u8>,

    /// Remaining body bytes of the current (already classified) record.
    contlen: u64,
    /// Bytes of the current record already consumed; index into `noop`.
    rec_off: usize,
    /// The replacement image when the current record is being skipped.
    noop: Option<Vec<u8>>,
    /// Target of `SkipToPage`.
    skip_until: Lsn,
    /// Consuming the zero-filled tail of a segment after XLOG_SWITCH.
    switch_tail: bool,

    // Per-message output.
    out: BytesMut,
    out_lsn: Lsn,
}

impl WalFilter {
    pub fn new(requested_start_pos: Lsn, include_tablespaces: Option<HashSet<Oid>>) -> WalFilter {
        let (state, skip_until) = if requested_start_pos.block_offset() == 0 {
            (FilterState::ScanHeader, requested_start_pos)
        } else {
            // Mid-page positions can't be parsed without the page header;
            // drop up to the next page boundary and align there.
            (FilterState::SkipToPage, requested_start_pos.page_lsn_ceil())
        };
        WalFilter {
            state,
            requested_start_pos,
            current_pos: requested_start_pos,
            include_tablespaces,
            synchronized: false,
            emit_from: requested_start_pos,
            buffer: Vec::new(),
            buffer_start: requested_start_pos,
            assembly: Vec::new(),
            contlen: 0,
            rec_off: 0,
            noop: None,
            skip_until,
            switch_tail: false,
            out: BytesMut::new(),
            out_lsn: Lsn::INVALID,
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn requested_start_pos(&self) -> Lsn {
        self.requested_start_pos
    }

    /// Bytes to forward downstream for the last processed message.
    pub fn output(&self) -> &[u8] {
        &self.out
    }

    /// LSN of the first byte of `output()`. Only meaningful when the output
    /// is non-empty.
    pub fn output_start(&self) -> Lsn {
        self.out_lsn
    }

    /// Bytes withheld at the end of the last processed message; the
    /// reported walEnd must be moved back by this much.
    pub fn held_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Run one upstream WAL payload through the filter. On `Continue` the
    /// transformed bytes are available through `output()`.
    pub fn process_message(
        &mut self,
        data_start: Lsn,
        payload: &[u8],
    ) -> anyhow::Result<ProcessResult> {
        self.out.clear();
        self.out_lsn = Lsn::INVALID;

        if data_start != self.current_pos {
            warn!(
                "upstream stream is discontinuous: at {}, message starts at {}",
                self.current_pos, data_start
            );
            return Ok(ProcessResult::Restart(self.restart()));
        }

        let mut pos = 0usize;
        while pos < payload.len() {
            if self.switch_tail {
                self.consume_switch_tail(payload, &mut pos);
                continue;
            }
            match self.state {
                FilterState::SkipToPage => self.consume_unparseable(payload, &mut pos),
                FilterState::ScanHeader => {
                    if let Some(restart) = self.consume_page_header(payload, &mut pos)? {
                        return Ok(ProcessResult::Restart(restart));
                    }
                }
                FilterState::ScanRecord if self.contlen > 0 => {
                    self.copy_record_body(payload, &mut pos)
                }
                FilterState::SkipRecord => self.overwrite_record_body(payload, &mut pos),
                FilterState::ScanRecord
                | FilterState::BufferRecord
                | FilterState::BufferFilenode => {
                    if self.current_pos.block_offset() == 0 {
                        self.state = FilterState::ScanHeader;
                        continue;
                    }
                    let pad = self.current_pos.calc_padding(8u64);
                    if self.contlen == 0 && self.assembly.is_empty() && pad != 0 {
                        // alignment padding between records passes through
                        let take = (pad as usize).min(payload.len() - pos);
                        self.emit(self.current_pos, &payload[pos..pos + take]);
                        self.current_pos += take as u64;
                        pos += take;
                        continue;
                    }
                    if let Some(restart) = self.classify_record(payload, &mut pos)? {
                        return Ok(ProcessResult::Restart(restart));
                    }
                }
            }
        }

        trace!(
            "processed {} bytes at {}: emitting {} holding {}",
            payload.len(),
            data_start,
            self.out.len(),
            self.buffer.len()
        );
        Ok(ProcessResult::Continue)
    }

    /// Bytes after an XLOG_SWITCH record up to the end of the segment carry
    /// no page structure; pass them along untouched.
    fn consume_switch_tail(&mut self, payload: &[u8], pos: &mut usize) {
        let to_seg_end = WAL_SEGMENT_SIZE - self.current_pos.segment_offset(WAL_SEGMENT_SIZE);
        let take = to_seg_end.min(payload.len() - *pos);
        self.emit(self.current_pos, &payload[*pos..*pos + take]);
        self.current_pos += take as u64;
        *pos += take;
        if self.current_pos.segment_offset(WAL_SEGMENT_SIZE) == 0 {
            self.switch_tail = false;
            self.state = FilterState::ScanHeader;
        }
    }

    /// `SkipToPage`: drop bytes up to `skip_until`, then either parse the
    /// page header there or declare ourselves synchronized mid-page.
    fn consume_unparseable(&mut self, payload: &[u8], pos: &mut usize) {
        debug_assert!(self.buffer.is_empty());
        let left = (self.skip_until.0 - self.current_pos.0) as usize;
        let take = left.min(payload.len() - *pos);
        self.current_pos += take as u64;
        *pos += take;
        if self.current_pos == self.skip_until {
            if self.current_pos.block_offset() == 0 {
                self.state = FilterState::ScanHeader;
            } else {
                self.synchronize(self.current_pos);
                self.state = FilterState::ScanRecord;
            }
        }
    }

    /// `ScanHeader`: assemble and validate the page header at the current
    /// page boundary, then route based on what the page says and what we
    /// were doing when we reached it.
    fn consume_page_header(
        &mut self,
        payload: &[u8],
        pos: &mut usize,
    ) -> anyhow::Result<Option<Lsn>> {
        let page_lsn = self.current_pos.page_lsn();
        let hdr_len = page_header_size_at(page_lsn);
        let consumed = self.current_pos.block_offset() as usize;
        debug_assert!(consumed < hdr_len);

        let need = hdr_len - consumed;
        let take = need.min(payload.len() - *pos);
        self.push_buffer(self.current_pos, &payload[*pos..*pos + take]);
        self.current_pos += take as u64;
        *pos += take;
        if take < need {
            return Ok(None); // header continues in the next message
        }
        if self.buffer.len() > FL_BUFFER_LEN {
            return Ok(Some(self.restart()));
        }

        let hdr_bytes = &self.buffer[self.buffer.len() - hdr_len..];
        let hdr = XLogPageHeaderData::from_bytes(&mut &hdr_bytes[..]);
        validate_page_header(&hdr, page_lsn)?;
        let long_expected = hdr_len == XLOG_SIZE_OF_XLOG_LONG_PHD;
        if hdr.is_long_header() != long_expected {
            bail!(
                "page {} {} carry the segment-start header",
                page_lsn,
                if long_expected { "must" } else { "must not" }
            );
        }
        if long_expected {
            let long = XLogLongPageHeaderData::from_bytes(&mut &hdr_bytes[..]);
            validate_long_page_header(&long)?;
        }
        let contrecord = hdr.xlp_info & XLP_FIRST_IS_CONTRECORD != 0;
        let rem_len = hdr.xlp_rem_len as u64;

        if !self.assembly.is_empty() {
            // A record classification is in flight across this boundary:
            // the header stays withheld in `buffer` and the classification
            // resumes after it.
            if !contrecord {
                warn!("contrecord flag missing at {} mid-record", page_lsn);
                return Ok(Some(self.restart()));
            }
            if self.assembly.len() >= 4 {
                let tot_len =
                    u32::from_le_bytes(self.assembly[0..4].try_into().unwrap()) as u64;
                match tot_len.checked_sub(self.assembly.len() as u64) {
                    Some(remaining) if rem_len == remaining => {}
                    _ => {
                        warn!(
                            "page {} declares {} remaining bytes, record of {} has {} in hand",
                            page_lsn,
                            rem_len,
                            tot_len,
                            self.assembly.len()
                        );
                        return Ok(Some(self.restart()));
                    }
                }
            }
            self.state = self.buffering_state();
            return Ok(None);
        }

        if self.synchronized {
            if self.contlen > 0 {
                // mid-record: the page must agree with our own accounting
                if !contrecord || rem_len != self.contlen {
                    warn!(
                        "page {} continuation {} disagrees with record remainder {}",
                        page_lsn, rem_len, self.contlen
                    );
                    return Ok(Some(self.restart()));
                }
            } else if contrecord || rem_len != 0 {
                warn!("unexpected continuation at {}", page_lsn);
                return Ok(Some(self.restart()));
            }
            self.flush_buffer_verbatim();
            self.state = if self.contlen == 0 {
                FilterState::ScanRecord
            } else if self.noop.is_some() {
                FilterState::SkipRecord
            } else {
                FilterState::ScanRecord
            };
            return Ok(None);
        }

        // Unsynchronized: we just (re)started here. A continuation belongs
        // to a record whose start we never saw; it cannot be classified, so
        // it is dropped and emission begins at the next record boundary.
        if !contrecord {
            self.synchronize(page_lsn);
            self.flush_buffer_verbatim();
            self.state = FilterState::ScanRecord;
            return Ok(None);
        }
        debug!(
            "dropping {} continuation bytes at {} to synchronize",
            rem_len, page_lsn
        );
        self.buffer.clear();
        let page_capacity = (XLOG_BLCKSZ - hdr_len) as u64;
        self.skip_until = if rem_len > page_capacity {
            page_lsn + XLOG_BLCKSZ as u64
        } else {
            (self.current_pos + rem_len).align()
        };
        self.state = FilterState::SkipToPage;
        Ok(None)
    }

    /// Pass through the body of a kept record.
    fn copy_record_body(&mut self, payload: &[u8], pos: &mut usize) {
        let take = self.body_chunk_len(payload, *pos);
        self.emit(self.current_pos, &payload[*pos..*pos + take]);
        self.advance_record(take);
        *pos += take;
    }

    /// Emit the NOOP image instead of the body of a skipped record.
    fn overwrite_record_body(&mut self, payload: &[u8], pos: &mut usize) {
        let take = self.body_chunk_len(payload, *pos);
        let chunk = {
            let noop = self.noop.as_ref().expect("skip without replacement image");
            noop[self.rec_off..self.rec_off + take].to_vec()
        };
        self.emit(self.current_pos, &chunk);
        self.advance_record(take);
        *pos += take;
    }

    /// How much of the current record's body we can consume right now:
    /// bounded by the message, the record and the page.
    fn body_chunk_len(&self, payload: &[u8], pos: usize) -> usize {
        let avail = payload.len() - pos;
        let to_page = self.current_pos.remaining_in_block() as usize;
        avail.min(self.contlen as usize).min(to_page)
    }

    fn advance_record(&mut self, take: usize) {
        self.current_pos += take as u64;
        self.contlen -= take as u64;
        self.rec_off += take;
        if self.contlen == 0 {
            self.noop = None;
            self.state = FilterState::ScanRecord;
        } else if self.current_pos.block_offset() == 0 {
            self.state = FilterState::ScanHeader;
        }
    }

    /// At a record boundary (possibly resuming): gather header and block
    /// references until the record can be classified, then flush the
    /// withheld bytes verbatim or through the NOOP rewrite.
    fn classify_record(&mut self, payload: &[u8], pos: &mut usize) -> anyhow::Result<Option<Lsn>> {
        loop {
            let needed = match self.scan_assembly()? {
                BlockRefScan::Complete(nodes) => {
                    self.finish_classification(&nodes)?;
                    return Ok(None);
                }
                BlockRefScan::NeedMore(n) => n,
            };

            if self.current_pos.block_offset() == 0 {
                // the rest of the record is behind a page header
                self.state = FilterState::ScanHeader;
                return Ok(None);
            }

            let need_now = needed - self.assembly.len();
            let to_page = self.current_pos.remaining_in_block() as usize;
            let avail = payload.len() - *pos;
            let take = need_now.min(to_page).min(avail);
            if take == 0 {
                // message exhausted; carry what we have
                self.state = self.buffering_state();
                return Ok(None);
            }

            self.push_buffer(self.current_pos, &payload[*pos..*pos + take]);
            self.assembly.extend_from_slice(&payload[*pos..*pos + take]);
            self.current_pos += take as u64;
            *pos += take;
            if self.buffer.len() > FL_BUFFER_LEN {
                return Ok(Some(self.restart()));
            }
        }
    }

    /// Scan the assembled record prefix. Without tablespace filtering the
    /// block references are irrelevant and the header alone suffices.
    fn scan_assembly(&self) -> anyhow::Result<BlockRefScan> {
        if self.include_tablespaces.is_none() {
            if self.assembly.len() < XLOG_SIZE_OF_XLOG_RECORD {
                return Ok(BlockRefScan::NeedMore(XLOG_SIZE_OF_XLOG_RECORD));
            }
            return Ok(BlockRefScan::Complete(Vec::new()));
        }
        Ok(scan_rel_file_nodes(&self.assembly)?)
    }

    fn finish_classification(&mut self, nodes: &[RelFileNode]) -> anyhow::Result<()> {
        let hdr = XLogRecord::from_bytes(&mut &self.assembly[..]);
        let tot_len = hdr.xl_tot_len as u64;
        if (tot_len as usize) < XLOG_SIZE_OF_XLOG_RECORD {
            bail!(
                "record at {} has invalid total length {}",
                self.buffer_start,
                tot_len
            );
        }

        let keep = match &self.include_tablespaces {
            None => true,
            Some(spcs) => nodes.iter().all(|node| spcs.contains(&node.spcnode)),
        };

        self.contlen = tot_len - self.assembly.len() as u64;
        self.rec_off = self.assembly.len();

        if keep {
            self.flush_buffer_verbatim();
            self.noop = None;
            self.state = FilterState::ScanRecord;
            if hdr.is_xlog_switch_record()
                && self.current_pos.segment_offset(WAL_SEGMENT_SIZE) != 0
            {
                self.switch_tail = self.contlen == 0;
            }
        } else {
            debug!(
                "rewriting record at {} ({} bytes, tablespaces {:?}) as noop",
                self.buffer_start,
                tot_len,
                nodes.iter().map(|n| n.spcnode).collect::<Vec<_>>()
            );
            let noop = encode_noop_record(&hdr);
            self.flush_buffer_rewritten(&noop);
            self.state = if self.contlen == 0 {
                self.noop = None;
                FilterState::ScanRecord
            } else {
                self.noop = Some(noop);
                FilterState::SkipRecord
            };
        }
        self.assembly.clear();
        Ok(())
    }

    /// Append withheld raw bytes, starting the region if it was empty.
    fn push_buffer(&mut self, lsn: Lsn, bytes: &[u8]) {
        if self.buffer.is_empty() {
            self.buffer_start = lsn;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// The withheld region was classified as pass-through: emit it as-is.
    fn flush_buffer_verbatim(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.buffer);
        self.emit(self.buffer_start, &bytes);
    }

    /// The withheld region belongs to a skipped record: emit the NOOP image
    /// in its place, except for page-header bytes which pass verbatim.
    fn flush_buffer_rewritten(&mut self, noop: &[u8]) {
        if self.buffer.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.buffer);
        let mut rewritten = Vec::with_capacity(bytes.len());
        let mut lsn = self.buffer_start;
        let mut rec_off = 0usize;
        for &raw in &bytes {
            let page = lsn.page_lsn();
            let in_page_header = (lsn.block_offset() as usize) < page_header_size_at(page);
            if in_page_header {
                rewritten.push(raw);
            } else {
                rewritten.push(noop[rec_off]);
                rec_off += 1;
            }
            lsn += 1u64;
        }
        self.emit(self.buffer_start, &rewritten);
    }

    /// Append bytes to the message output, honoring the emission floor.
    fn emit(&mut self, start_lsn: Lsn, bytes: &[u8]) {
        if !self.synchronized || bytes.is_empty() {
            return;
        }
        let skip = if start_lsn < self.emit_from {
            ((self.emit_from.0 - start_lsn.0) as usize).min(bytes.len())
        } else {
            0
        };
        if skip == bytes.len() {
            return;
        }
        let first = start_lsn + skip as u64;
        if self.out.is_empty() {
            self.out_lsn = first;
        } else {
            debug_assert_eq!(self.out_lsn + self.out.len() as u64, first);
        }
        self.out.extend_from_slice(&bytes[skip..]);
    }

    fn synchronize(&mut self, at: Lsn) {
        debug!("synchronized with the record stream at {}", at);
        self.synchronized = true;
        self.emit_from = self.emit_from.max(at);
    }

    /// Forget everything undecided and line up a clean re-parse from the
    /// last page boundary before the first byte we never emitted.
    fn restart(&mut self) -> Lsn {
        let resume_emit = if self.buffer.is_empty() {
            self.current_pos
        } else {
            self.buffer_start
        };
        let restart_pos = resume_emit.page_lsn();
        self.emit_from = self.emit_from.max(resume_emit);
        self.buffer.clear();
        self.assembly.clear();
        self.noop = None;
        self.contlen = 0;
        self.rec_off = 0;
        self.switch_tail = false;
        self.synchronized = false;
        self.current_pos = restart_pos;
        self.buffer_start = restart_pos;
        self.state = FilterState::ScanHeader;
        self.out.clear();
        self.out_lsn = Lsn::INVALID;
        debug!(
            "restarting upstream stream at {}, emission resumes at {}",
            restart_pos, self.emit_from
        );
        restart_pos
    }

    fn buffering_state(&self) -> FilterState {
        if self.assembly.len() < XLOG_SIZE_OF_XLOG_RECORD {
            FilterState::BufferRecord
        } else {
            FilterState::BufferFilenode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use postgres_ffi::pg_constants::{
        BKPBLOCK_HAS_DATA, XLR_BLOCK_ID_DATA_LONG, XLR_BLOCK_ID_DATA_SHORT,
    };
    use postgres_ffi::{RelFileNode, XLOG_PAGE_MAGIC};

    const SPC_KEEP: Oid = 1663;
    const SPC_DROP: Oid = 16385;

    /// Lays records out into pages the way the server does: short page
    /// headers at every boundary, continuation bookkeeping, 8-byte record
    /// alignment.
    struct WalStream {
        start: Lsn,
        pos: Lsn,
        buf: Vec<u8>,
    }

    impl WalStream {
        fn new(start: Lsn) -> WalStream {
            assert_eq!(start.block_offset(), 0);
            assert_ne!(start.segment_offset(WAL_SEGMENT_SIZE), 0);
            WalStream {
                start,
                pos: start,
                buf: Vec::new(),
            }
        }

        fn page_header(&mut self, rem_len: usize) {
            let hdr = XLogPageHeaderData {
                xlp_magic: XLOG_PAGE_MAGIC,
                xlp_info: if rem_len > 0 {
                    XLP_FIRST_IS_CONTRECORD
                } else {
                    0
                },
                xlp_tli: 1,
                xlp_pageaddr: self.pos.0,
                xlp_rem_len: rem_len as u32,
            };
            let mut bytes = BytesMut::new();
            hdr.encode(&mut bytes);
            self.buf.extend_from_slice(&bytes);
            self.pos += bytes.len() as u64;
        }

        fn push_record(&mut self, rec: &[u8]) -> Lsn {
            let mut off = 0;
            let mut start = None;
            while off < rec.len() {
                if self.pos.block_offset() == 0 {
                    self.page_header(if off > 0 { rec.len() - off } else { 0 });
                }
                if start.is_none() {
                    start = Some(self.pos);
                }
                let room = self.pos.remaining_in_block() as usize;
                let take = room.min(rec.len() - off);
                self.buf.extend_from_slice(&rec[off..off + take]);
                self.pos += take as u64;
                off += take;
            }
            let pad = self.pos.calc_padding(8u64) as usize;
            self.buf.extend(std::iter::repeat(0u8).take(pad));
            self.pos += pad as u64;
            start.unwrap()
        }

        fn offset_of(&self, lsn: Lsn) -> usize {
            (lsn.0 - self.start.0) as usize
        }
    }

    /// A record with one block reference into `spc` and a short main-data
    /// payload of `payload_len` 0xAB bytes.
    fn make_record(spc: Option<Oid>, payload_len: usize) -> Vec<u8> {
        assert!(payload_len <= u8::MAX as usize);
        let mut body = BytesMut::new();
        if let Some(spc) = spc {
            body.put_u8(0); // block id
            body.put_u8(BKPBLOCK_HAS_DATA);
            body.put_u16_le(4); // block data length
            RelFileNode {
                spcnode: spc,
                dbnode: 5,
                relnode: 16400,
            }
            .encode(&mut body);
            body.put_u32_le(3); // blkno
        }
        body.put_u8(XLR_BLOCK_ID_DATA_SHORT);
        body.put_u8(payload_len as u8);
        if spc.is_some() {
            body.put_slice(&[0xB0, 0xB1, 0xB2, 0xB3]); // block data
        }
        body.extend(std::iter::repeat(0xABu8).take(payload_len));
        finish_record(body, 0x00, 10 /* RM_HEAP_ID */)
    }

    /// A record with one block reference and a large long-form main data
    /// payload, for crossing page boundaries.
    fn make_big_record(spc: Oid, payload_len: usize) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_u8(0); // no flags, no data
        body.put_u16_le(0);
        RelFileNode {
            spcnode: spc,
            dbnode: 5,
            relnode: 16400,
        }
        .encode(&mut body);
        body.put_u32_le(3);
        body.put_u8(XLR_BLOCK_ID_DATA_LONG);
        body.put_u32_le(payload_len as u32);
        body.extend((0..payload_len).map(|i| (i % 251) as u8));
        finish_record(body, 0x00, 10)
    }

    fn finish_record(body: BytesMut, info: u8, rmid: u8) -> Vec<u8> {
        let hdr = XLogRecord {
            xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32,
            xl_xid: 1234,
            xl_prev: 0xDEAD_BEEF,
            xl_info: info,
            xl_rmid: rmid,
            xl_crc: 0x1111_2222,
        };
        let mut rec = BytesMut::new();
        hdr.encode(&mut rec);
        rec.extend_from_slice(&body);
        rec.to_vec()
    }

    fn include(spcs: &[Oid]) -> Option<HashSet<Oid>> {
        Some(spcs.iter().copied().collect())
    }

    /// Feed `bytes` in messages split at the given offsets, asserting the
    /// per-message accounting, and return the concatenated output.
    fn feed(filter: &mut WalFilter, start: Lsn, bytes: &[u8], splits: &[usize]) -> (Lsn, Vec<u8>) {
        let mut all = Vec::new();
        let mut first_lsn = Lsn::INVALID;
        let mut prev = 0;
        for &split in splits.iter().chain(std::iter::once(&bytes.len())) {
            assert!(split >= prev && split <= bytes.len());
            let res = filter
                .process_message(start + prev as u64, &bytes[prev..split])
                .unwrap();
            assert_eq!(res, ProcessResult::Continue);
            if !filter.output().is_empty() {
                if first_lsn == Lsn::INVALID {
                    first_lsn = filter.output_start();
                } else {
                    // LSN monotonicity between consecutive envelopes
                    assert_eq!(
                        filter.output_start(),
                        first_lsn + all.len() as u64,
                        "output must stay contiguous"
                    );
                }
                all.extend_from_slice(filter.output());
            }
            prev = split;
        }
        (first_lsn, all)
    }

    const START: Lsn = Lsn(0x1A000);

    #[test]
    fn passthrough_without_filtering() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        stream.push_record(&make_record(Some(SPC_DROP), 60));
        stream.push_record(&make_record(None, 20));

        let mut filter = WalFilter::new(START, None);
        let (first, out) = feed(&mut filter, START, &stream.buf, &[]);
        assert_eq!(first, START);
        assert_eq!(out, stream.buf);
        assert_eq!(filter.held_bytes(), 0);
        assert!(filter.synchronized());
    }

    #[test]
    fn foreign_tablespace_record_becomes_noop() {
        let mut stream = WalStream::new(START);
        let rec_a = stream.push_record(&make_record(Some(SPC_KEEP), 40));
        let rec_b = stream.push_record(&make_record(Some(SPC_DROP), 60));
        let rec_c = stream.push_record(&make_record(None, 20));

        let mut filter = WalFilter::new(START, include(&[SPC_KEEP]));
        let (first, out) = feed(&mut filter, START, &stream.buf, &[]);
        assert_eq!(first, START);
        // length preservation
        assert_eq!(out.len(), stream.buf.len());

        // the kept record and everything around the filtered one is untouched
        let b_off = stream.offset_of(rec_b);
        let c_off = stream.offset_of(rec_c);
        assert_eq!(out[..b_off], stream.buf[..b_off]);
        assert_eq!(out[c_off..], stream.buf[c_off..]);
        assert_eq!(stream.offset_of(rec_a), 24); // sanity: behind page header

        // the filtered record is a well-formed NOOP of the same length
        let orig_hdr = XLogRecord::from_bytes(&mut &stream.buf[b_off..]);
        let expected = encode_noop_record(&orig_hdr);
        assert_eq!(out[b_off..b_off + expected.len()], expected[..]);
    }

    #[test]
    fn record_split_across_messages_is_buffered() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        let rec_b = stream.push_record(&make_record(Some(SPC_DROP), 60));
        stream.push_record(&make_record(Some(SPC_KEEP), 20));

        let b_off = stream.offset_of(rec_b);
        // first envelope ends 10 bytes into the record header
        let split = b_off + 10;

        let mut filter = WalFilter::new(START, include(&[SPC_KEEP]));

        let res = filter
            .process_message(START, &stream.buf[..split])
            .unwrap();
        assert_eq!(res, ProcessResult::Continue);
        assert_eq!(filter.state(), FilterState::BufferRecord);
        // the partial header is withheld, everything before it was emitted
        assert_eq!(filter.held_bytes(), 10);
        assert_eq!(filter.output().len(), b_off);

        let res = filter
            .process_message(START + split as u64, &stream.buf[split..])
            .unwrap();
        assert_eq!(res, ProcessResult::Continue);
        // the withheld bytes come out first: dataStart backs up to the
        // original LSN of the first buffered byte
        assert_eq!(filter.output_start(), rec_b);
        assert_eq!(filter.held_bytes(), 0);

        let orig_hdr = XLogRecord::from_bytes(&mut &stream.buf[b_off..]);
        let expected = encode_noop_record(&orig_hdr);
        assert_eq!(filter.output()[..expected.len()], expected[..]);
    }

    #[test]
    fn filtered_record_crossing_pages_keeps_interior_page_header() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        let rec_b = stream.push_record(&make_big_record(SPC_DROP, 20000));
        stream.push_record(&make_record(Some(SPC_KEEP), 20));

        let mut filter = WalFilter::new(START, include(&[SPC_KEEP]));
        let (_, out) = feed(&mut filter, START, &stream.buf, &[]);
        assert_eq!(out.len(), stream.buf.len());

        // interior page headers pass through verbatim
        let second_page = stream.offset_of(Lsn(START.0 + XLOG_BLCKSZ as u64));
        assert_eq!(
            out[second_page..second_page + 24],
            stream.buf[second_page..second_page + 24]
        );
        let third_page = stream.offset_of(Lsn(START.0 + 2 * XLOG_BLCKSZ as u64));
        assert_eq!(
            out[third_page..third_page + 24],
            stream.buf[third_page..third_page + 24]
        );

        // the record's bytes past its NOOP preamble are zeroed, on both pages
        let b_off = stream.offset_of(rec_b);
        assert!(out[b_off + 40..second_page].iter().all(|&b| b == 0));
        assert!(out[second_page + 24..second_page + 100].iter().all(|&b| b == 0));
    }

    #[test]
    fn unsynchronized_continuation_is_dropped() {
        // build a stream whose second page starts with a continuation
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        stream.push_record(&make_big_record(SPC_KEEP, 9000)); // crosses into page 2
        let rec_c = stream.push_record(&make_record(Some(SPC_KEEP), 20));
        stream.push_record(&make_record(Some(SPC_KEEP), 32));

        // the standby reconnects at the page-2 boundary, mid-record
        let page2 = Lsn(START.0 + XLOG_BLCKSZ as u64);
        let tail = &stream.buf[stream.offset_of(page2)..];

        let mut filter = WalFilter::new(page2, None);
        let (first, out) = feed(&mut filter, page2, tail, &[]);

        // nothing before the first full record boundary is emitted
        assert_eq!(first, rec_c);
        let rec_c_off = stream.offset_of(rec_c);
        assert_eq!(out, stream.buf[rec_c_off..]);
        assert!(filter.synchronized());
    }

    #[test]
    fn fresh_page_start_emits_from_requested_position() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));

        let mut filter = WalFilter::new(START, None);
        let (first, out) = feed(&mut filter, START, &stream.buf, &[]);
        // the page header itself is part of the emitted stream
        assert_eq!(first, START);
        assert_eq!(out, stream.buf);
    }

    #[test]
    fn discontinuous_stream_requests_restart() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        let rec_b = stream.push_record(&make_record(Some(SPC_KEEP), 52));

        let b_off = stream.offset_of(rec_b);
        let mut filter = WalFilter::new(START, None);
        let res = filter
            .process_message(START, &stream.buf[..b_off])
            .unwrap();
        assert_eq!(res, ProcessResult::Continue);

        // a gap in the stream must force a resync
        let res = filter
            .process_message(rec_b + 8u64, &stream.buf[b_off + 8..])
            .unwrap();
        match res {
            ProcessResult::Restart(pos) => assert_eq!(pos, rec_b.page_lsn()),
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[test]
    fn restart_resumes_emission_where_it_stopped() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        stream.push_record(&make_big_record(SPC_KEEP, 9000)); // crosses into page 2
        let rec_c = stream.push_record(&make_record(Some(SPC_KEEP), 20));
        let rec_d = stream.push_record(&make_record(Some(SPC_KEEP), 32));

        let d_off = stream.offset_of(rec_d);
        let mut filter = WalFilter::new(START, None);
        let res = filter
            .process_message(START, &stream.buf[..d_off])
            .unwrap();
        assert_eq!(res, ProcessResult::Continue);
        assert_eq!(filter.output().len(), d_off);

        // stream breaks; the caller restarts from the page boundary
        let res = filter
            .process_message(rec_d + 100u64, &[0u8; 10])
            .unwrap();
        let restart = match res {
            ProcessResult::Restart(pos) => pos,
            other => panic!("expected restart, got {other:?}"),
        };
        assert_eq!(restart, rec_d.page_lsn());
        assert!(restart <= rec_c.page_lsn_ceil());

        // re-feed from the restart position: already-delivered bytes are
        // not emitted again, the stream resumes exactly at rec_d
        let (first, out) = feed(
            &mut filter,
            restart,
            &stream.buf[stream.offset_of(restart)..],
            &[],
        );
        assert_eq!(first, rec_d);
        assert_eq!(out, stream.buf[d_off..]);
    }

    #[test]
    fn mid_page_start_skips_to_page_boundary() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        let rec_b = stream.push_record(&make_big_record(SPC_KEEP, 3000));
        stream.push_record(&make_big_record(SPC_KEEP, 3000));
        stream.push_record(&make_big_record(SPC_KEEP, 9000));
        let rec_e = stream.push_record(&make_record(Some(SPC_KEEP), 16));

        // start mid-page, mid-record: everything up to the next page
        // boundary is unparseable, and that page starts with a continuation
        let from = rec_b + 10u64;
        let mut filter = WalFilter::new(from, None);
        assert_eq!(filter.state(), FilterState::SkipToPage);
        let (first, out) = feed(
            &mut filter,
            from,
            &stream.buf[stream.offset_of(from)..],
            &[],
        );
        // first thing parseable is rec_e, after the continuation on page 2
        assert_eq!(first, rec_e);
        assert_eq!(out, stream.buf[stream.offset_of(rec_e)..]);
    }

    #[test]
    fn split_points_do_not_change_the_output() {
        let mut stream = WalStream::new(START);
        stream.push_record(&make_record(Some(SPC_KEEP), 40));
        stream.push_record(&make_record(Some(SPC_DROP), 200));
        stream.push_record(&make_big_record(SPC_DROP, 9000));
        stream.push_record(&make_record(None, 30));
        stream.push_record(&make_record(Some(SPC_KEEP), 64));

        let mut reference_filter = WalFilter::new(START, include(&[SPC_KEEP]));
        let (_, reference) = feed(&mut reference_filter, START, &stream.buf, &[]);
        assert_eq!(reference.len(), stream.buf.len());

        // chop the stream at awkward places: mid page header, mid record
        // header, mid body, at boundaries
        let splits: Vec<usize> = vec![10, 24, 30, 100, 8192, 8200, 9000, 9500];
        let mut filter = WalFilter::new(START, include(&[SPC_KEEP]));
        let (first, out) = feed(&mut filter, START, &stream.buf, &splits);
        assert_eq!(first, START);
        assert_eq!(out, reference);
    }
}
