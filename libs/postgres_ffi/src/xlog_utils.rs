//! Common utilities for dealing with WAL layout: header sizes, LSN page
//! math, timestamps, and construction of the NOOP records the filter uses to
//! overwrite filtered-out data.

use crate::pg_constants;
use crate::XLogPageHeaderData;
use crate::XLogRecord;
use crate::TimestampTz;
use crate::{WAL_SEGMENT_SIZE, XLOG_BLCKSZ};

use bytes::{BufMut, BytesMut};
use crc32c::crc32c_append;
use std::time::SystemTime;
use utils::lsn::Lsn;

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = XLOG_SIZE_OF_XLOG_SHORT_PHD + 16;
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = 24;
/// Offset of xl_crc within XLogRecord: the crc covers everything before it.
pub const XLOG_RECORD_CRC_OFFS: usize = 4 + 4 + 8 + 1 + 1 + 2;
/// Biggest chunk the sender transmits in one XLogData message.
pub const MAX_SEND_SIZE: usize = XLOG_BLCKSZ * 16;

/// Size of the page header that starts at `lsn`, which must be page-aligned:
/// segment-start pages carry the long header.
pub fn page_header_size_at(lsn: Lsn) -> usize {
    debug_assert_eq!(lsn.block_offset(), 0);
    if lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
        XLOG_SIZE_OF_XLOG_LONG_PHD
    } else {
        XLOG_SIZE_OF_XLOG_SHORT_PHD
    }
}

/// Current timestamp in Postgres format: microseconds since 2000-01-01 UTC.
pub fn get_current_timestamp() -> TimestampTz {
    const UNIX_EPOCH_JDATE: u64 = 2440588; /* == date2j(1970, 1, 1) */
    const POSTGRES_EPOCH_JDATE: u64 = 2451545; /* == date2j(2000, 1, 1) */
    const SECS_PER_DAY: u64 = 86400;
    const USECS_PER_SEC: u64 = 1000000;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => {
            ((n.as_secs() - ((POSTGRES_EPOCH_JDATE - UNIX_EPOCH_JDATE) * SECS_PER_DAY))
                * USECS_PER_SEC
                + n.subsec_micros() as u64) as i64
        }
        Err(_) => panic!("SystemTime before UNIX EPOCH!"),
    }
}

/// Build the bytes of an RM_XLOG/NOOP record that occupies exactly the same
/// number of bytes as the record described by `hdr`. xl_prev and xl_xid are
/// preserved so the record chain stays intact; the payload is a main-data
/// header declaring a zero-filled chunk, and the crc is recomputed.
///
/// Returns the full record, `hdr.xl_tot_len` bytes.
pub fn encode_noop_record(hdr: &XLogRecord) -> Vec<u8> {
    let tot_len = hdr.xl_tot_len as usize;
    assert!(tot_len >= XLOG_SIZE_OF_XLOG_RECORD);
    let body_len = tot_len - XLOG_SIZE_OF_XLOG_RECORD;

    let mut body = BytesMut::with_capacity(body_len);
    if body_len >= 2 && body_len - 2 <= u8::MAX as usize {
        body.put_u8(pg_constants::XLR_BLOCK_ID_DATA_SHORT);
        body.put_u8((body_len - 2) as u8);
    } else if body_len >= 5 {
        body.put_u8(pg_constants::XLR_BLOCK_ID_DATA_LONG);
        body.put_u32_le((body_len - 5) as u32);
    }
    // A 1-byte body can't hold any data header; no real record is that
    // small, but zero-filling keeps the length right regardless.
    body.resize(body_len, 0);

    let noop_hdr = XLogRecord {
        xl_tot_len: hdr.xl_tot_len,
        xl_xid: hdr.xl_xid,
        xl_prev: hdr.xl_prev,
        xl_info: pg_constants::XLOG_NOOP,
        xl_rmid: pg_constants::RM_XLOG_ID,
        xl_crc: 0,
    };
    let mut hdr_bytes = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_RECORD);
    noop_hdr.encode(&mut hdr_bytes);

    // Like the server: crc of the record data first, then of the header up
    // to the crc field.
    let mut crc = 0;
    crc = crc32c_append(crc, &body);
    crc = crc32c_append(crc, &hdr_bytes[0..XLOG_RECORD_CRC_OFFS]);

    let mut rec = Vec::with_capacity(tot_len);
    rec.extend_from_slice(&hdr_bytes[0..XLOG_RECORD_CRC_OFFS]);
    rec.extend_from_slice(&crc.to_le_bytes());
    rec.extend_from_slice(&body);
    rec
}

/// Compute the crc a record with the given header and data would carry.
pub fn record_crc(hdr: &XLogRecord, data: &[u8]) -> u32 {
    let mut hdr_bytes = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_RECORD);
    hdr.encode(&mut hdr_bytes);
    let mut crc = 0;
    crc = crc32c_append(crc, data);
    crc32c_append(crc, &hdr_bytes[0..XLOG_RECORD_CRC_OFFS])
}

/// Validate the extended fields of a segment-start page header.
pub fn validate_long_page_header(hdr: &crate::XLogLongPageHeaderData) -> anyhow::Result<()> {
    if hdr.xlp_seg_size as usize != WAL_SEGMENT_SIZE {
        anyhow::bail!(
            "unsupported WAL segment size {} (only {} is supported)",
            hdr.xlp_seg_size,
            WAL_SEGMENT_SIZE
        );
    }
    if hdr.xlp_xlog_blcksz as usize != XLOG_BLCKSZ {
        anyhow::bail!(
            "unsupported WAL block size {} (only {} is supported)",
            hdr.xlp_xlog_blcksz,
            XLOG_BLCKSZ
        );
    }
    Ok(())
}

/// Validate a page header against the position it was read from.
pub fn validate_page_header(hdr: &XLogPageHeaderData, page_lsn: Lsn) -> anyhow::Result<()> {
    if hdr.xlp_magic != crate::XLOG_PAGE_MAGIC {
        anyhow::bail!(
            "invalid WAL page magic {:#x} at {}, expected {:#x}",
            hdr.xlp_magic,
            page_lsn,
            crate::XLOG_PAGE_MAGIC
        );
    }
    if hdr.xlp_info & !pg_constants::XLP_ALL_FLAGS != 0 {
        anyhow::bail!(
            "invalid WAL page flags {:#x} at {}",
            hdr.xlp_info,
            page_lsn
        );
    }
    if hdr.xlp_pageaddr != page_lsn.0 {
        anyhow::bail!(
            "WAL page address {} does not match stream position {}",
            Lsn(hdr.xlp_pageaddr),
            page_lsn
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walrecord::{scan_rel_file_nodes, BlockRefScan};

    #[test]
    fn noop_record_keeps_length_and_scans_clean() {
        let hdr = XLogRecord {
            xl_tot_len: 100,
            xl_xid: 42,
            xl_prev: 0x1500028,
            xl_info: 0x00,
            xl_rmid: pg_constants::RM_HEAP_ID,
            xl_crc: 0xdeadbeef,
        };
        let rec = encode_noop_record(&hdr);
        assert_eq!(rec.len(), 100);

        let parsed = XLogRecord::from_bytes(&mut &rec[..]);
        assert_eq!(parsed.xl_tot_len, 100);
        assert_eq!(parsed.xl_xid, 42);
        assert_eq!(parsed.xl_prev, 0x1500028);
        assert_eq!(parsed.xl_info, pg_constants::XLOG_NOOP);
        assert_eq!(parsed.xl_rmid, pg_constants::RM_XLOG_ID);
        assert_eq!(parsed.xl_crc, record_crc(&parsed, &rec[XLOG_SIZE_OF_XLOG_RECORD..]));

        // the rewritten record references no relations
        match scan_rel_file_nodes(&rec).unwrap() {
            BlockRefScan::Complete(nodes) => assert!(nodes.is_empty()),
            BlockRefScan::NeedMore(_) => panic!("complete record should scan fully"),
        }
    }

    #[test]
    fn noop_record_long_data_header() {
        let hdr = XLogRecord {
            xl_tot_len: 24 + 2000,
            xl_xid: 0,
            xl_prev: 0x2000,
            xl_info: 0x30,
            xl_rmid: pg_constants::RM_BTREE_ID,
            xl_crc: 0,
        };
        let rec = encode_noop_record(&hdr);
        assert_eq!(rec.len(), 24 + 2000);
        assert_eq!(rec[24], pg_constants::XLR_BLOCK_ID_DATA_LONG);
        match scan_rel_file_nodes(&rec).unwrap() {
            BlockRefScan::Complete(nodes) => assert!(nodes.is_empty()),
            BlockRefScan::NeedMore(_) => panic!("complete record should scan fully"),
        }
    }

    #[test]
    fn page_header_sizes() {
        assert_eq!(page_header_size_at(Lsn(0x1000000)), XLOG_SIZE_OF_XLOG_LONG_PHD);
        assert_eq!(page_header_size_at(Lsn(0x1002000)), XLOG_SIZE_OF_XLOG_SHORT_PHD);
    }

    #[test]
    fn page_header_validation() {
        let hdr = XLogPageHeaderData {
            xlp_magic: crate::XLOG_PAGE_MAGIC,
            xlp_info: pg_constants::XLP_BKP_REMOVABLE,
            xlp_tli: 1,
            xlp_pageaddr: 0x1502000,
            xlp_rem_len: 0,
        };
        validate_page_header(&hdr, Lsn(0x1502000)).unwrap();
        validate_page_header(&hdr, Lsn(0x1504000)).unwrap_err();

        let bad_magic = XLogPageHeaderData {
            xlp_magic: 0xD07E,
            ..hdr
        };
        validate_page_header(&bad_magic, Lsn(0x1502000)).unwrap_err();
    }
}
