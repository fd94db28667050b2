//! On-disk WAL structures of the PostgreSQL server this proxy understands,
//! rewritten in Rust. Field names are kept the same as the corresponding C
//! structs so that they can be compared against the PostgreSQL sources.

use bytes::{Buf, BufMut, BytesMut};

pub mod pg_constants;
pub mod walrecord;
pub mod xlog_utils;

pub type Oid = u32;
pub type TransactionId = u32;
pub type BlockNumber = u32;
pub type XLogRecPtr = u64;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogSegNo = u64;

/// WAL page size, bytes.
pub const XLOG_BLCKSZ: usize = 8192;
/// WAL segment size, bytes. Only the default is supported.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
/// Page header magic of the supported server version (16).
pub const XLOG_PAGE_MAGIC: u16 = 0xD113;

/// Fixed-size header of every WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogRecord {
    pub xl_tot_len: u32,
    pub xl_xid: TransactionId,
    pub xl_prev: XLogRecPtr,
    pub xl_info: u8,
    pub xl_rmid: u8,
    /* 2 bytes of padding here, initialize to zero */
    pub xl_crc: u32,
}

impl XLogRecord {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogRecord {
        XLogRecord {
            xl_tot_len: buf.get_u32_le(),
            xl_xid: buf.get_u32_le(),
            xl_prev: buf.get_u64_le(),
            xl_info: buf.get_u8(),
            xl_rmid: buf.get_u8(),
            xl_crc: {
                buf.advance(2);
                buf.get_u32_le()
            },
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.xl_tot_len);
        buf.put_u32_le(self.xl_xid);
        buf.put_u64_le(self.xl_prev);
        buf.put_u8(self.xl_info);
        buf.put_u8(self.xl_rmid);
        buf.put_u16_le(0);
        buf.put_u32_le(self.xl_crc);
    }

    // Is this record an XLOG_SWITCH record? They need some special processing,
    pub fn is_xlog_switch_record(&self) -> bool {
        self.xl_info == pg_constants::XLOG_SWITCH && self.xl_rmid == pg_constants::RM_XLOG_ID
    }
}

/// Header at the start of every WAL page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogPageHeaderData {
    pub xlp_magic: u16,
    pub xlp_info: u16,
    pub xlp_tli: TimeLineID,
    pub xlp_pageaddr: XLogRecPtr,
    pub xlp_rem_len: u32,
    /* 4 bytes of padding here to align the struct to 8 bytes */
}

impl XLogPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogPageHeaderData {
        let hdr: XLogPageHeaderData = XLogPageHeaderData {
            xlp_magic: buf.get_u16_le(),
            xlp_info: buf.get_u16_le(),
            xlp_tli: buf.get_u32_le(),
            xlp_pageaddr: buf.get_u64_le(),
            xlp_rem_len: buf.get_u32_le(),
        };
        buf.get_u32_le(); // padding
        hdr
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.xlp_magic);
        buf.put_u16_le(self.xlp_info);
        buf.put_u32_le(self.xlp_tli);
        buf.put_u64_le(self.xlp_pageaddr);
        buf.put_u32_le(self.xlp_rem_len);
        buf.put_u32_le(0);
    }

    pub fn is_long_header(&self) -> bool {
        self.xlp_info & pg_constants::XLP_LONG_HEADER != 0
    }
}

/// Extended header at the start of every WAL segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogLongPageHeaderData {
    pub std: XLogPageHeaderData,
    pub xlp_sysid: u64,
    pub xlp_seg_size: u32,
    pub xlp_xlog_blcksz: u32,
}

impl XLogLongPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogLongPageHeaderData {
        XLogLongPageHeaderData {
            std: XLogPageHeaderData::from_bytes(buf),
            xlp_sysid: buf.get_u64_le(),
            xlp_seg_size: buf.get_u32_le(),
            xlp_xlog_blcksz: buf.get_u32_le(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.std.encode(buf);
        buf.put_u64_le(self.xlp_sysid);
        buf.put_u32_le(self.xlp_seg_size);
        buf.put_u32_le(self.xlp_xlog_blcksz);
    }
}

/// Identity of a relation file: which tablespace, database and relation the
/// block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelFileNode {
    pub spcnode: Oid, // tablespace
    pub dbnode: Oid,  // database
    pub relnode: Oid, // relation
}

impl RelFileNode {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> RelFileNode {
        RelFileNode {
            spcnode: buf.get_u32_le(),
            dbnode: buf.get_u32_le(),
            relnode: buf.get_u32_le(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.spcnode);
        buf.put_u32_le(self.dbnode);
        buf.put_u32_le(self.relnode);
    }
}
