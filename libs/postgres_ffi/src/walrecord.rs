//! Enough of the WAL record data format to find out which relations a record
//! touches: the block-reference headers that precede the record data. The
//! walk mirrors the server's DecodeXLogRecord.

use crate::pg_constants::*;
use crate::xlog_utils::XLOG_SIZE_OF_XLOG_RECORD;
use crate::{RelFileNode, XLogRecord};

/// The record bytes could not be decoded; the stream is corrupt or from an
/// unsupported server version.
#[derive(Debug, thiserror::Error)]
#[error("invalid WAL record: {msg}")]
pub struct WalDecodeError {
    pub msg: String,
}

fn decode_error(msg: impl Into<String>) -> WalDecodeError {
    WalDecodeError { msg: msg.into() }
}

/// Result of scanning a (possibly partial) record for block references.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockRefScan {
    /// The prefix is too short to classify: at least this many bytes from
    /// the record start are needed to continue.
    NeedMore(usize),
    /// All block references seen; every RelFileNode the record touches, in
    /// block-id order.
    Complete(Vec<RelFileNode>),
}

/// Walk the block-reference headers of a record given a prefix of its bytes
/// (starting at the record header). Stops as soon as all references are
/// known, which never requires looking past the headers into the data
/// payload itself.
pub fn scan_rel_file_nodes(rec: &[u8]) -> Result<BlockRefScan, WalDecodeError> {
    if rec.len() < XLOG_SIZE_OF_XLOG_RECORD {
        return Ok(BlockRefScan::NeedMore(XLOG_SIZE_OF_XLOG_RECORD));
    }
    let hdr = XLogRecord::from_bytes(&mut &rec[..]);
    let tot_len = hdr.xl_tot_len as usize;
    if tot_len < XLOG_SIZE_OF_XLOG_RECORD {
        return Err(decode_error(format!(
            "record total length {} is shorter than the record header",
            tot_len
        )));
    }

    let mut nodes: Vec<RelFileNode> = Vec::new();
    let mut off = XLOG_SIZE_OF_XLOG_RECORD;
    // Bytes of the record not yet accounted for, and the portion of them
    // that is known to be data payload rather than headers.
    let mut remaining = tot_len - XLOG_SIZE_OF_XLOG_RECORD;
    let mut datatotal: usize = 0;

    // Reads a little-endian integer of SZ bytes at `off`, or reports how far
    // the caller needs to extend the prefix.
    macro_rules! take {
        ($sz:expr) => {{
            if off + $sz > tot_len || $sz > remaining {
                return Err(decode_error("block headers run past the record length"));
            }
            if off + $sz > rec.len() {
                return Ok(BlockRefScan::NeedMore((off + $sz).min(tot_len)));
            }
            let bytes = &rec[off..off + $sz];
            off += $sz;
            remaining -= $sz;
            bytes
        }};
    }

    while remaining > datatotal {
        let block_id = take!(1)[0];

        match block_id {
            XLR_BLOCK_ID_DATA_SHORT => {
                let len = take!(1)[0] as usize;
                datatotal += len;
            }
            XLR_BLOCK_ID_DATA_LONG => {
                let len = u32::from_le_bytes(take!(4).try_into().unwrap()) as usize;
                datatotal += len;
            }
            XLR_BLOCK_ID_ORIGIN => {
                take!(2);
            }
            XLR_BLOCK_ID_TOPLEVEL_XID => {
                take!(4);
            }
            block_id if block_id <= XLR_MAX_BLOCK_ID => {
                let fork_flags = take!(1)[0];
                let data_len = u16::from_le_bytes(take!(2).try_into().unwrap()) as usize;
                if fork_flags & BKPBLOCK_HAS_DATA == 0 && data_len != 0 {
                    return Err(decode_error(format!(
                        "BKPBLOCK_HAS_DATA not set, but data length is {}",
                        data_len
                    )));
                }
                datatotal += data_len;

                if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                    let image_len = u16::from_le_bytes(take!(2).try_into().unwrap()) as usize;
                    take!(2); // hole offset
                    let bimg_info = take!(1)[0];
                    if bimg_info & BKPIMAGE_HAS_HOLE != 0 && bkpimage_is_compressed(bimg_info) {
                        take!(2); // hole length
                    }
                    datatotal += image_len;
                }

                if fork_flags & BKPBLOCK_SAME_REL == 0 {
                    let mut rnode_bytes = take!(12);
                    nodes.push(RelFileNode::from_bytes(&mut rnode_bytes));
                } else {
                    let prev = *nodes
                        .last()
                        .ok_or_else(|| decode_error("BKPBLOCK_SAME_REL set but no previous rel"))?;
                    nodes.push(prev);
                }
                take!(4); // block number
            }
            block_id => {
                return Err(decode_error(format!(
                    "invalid block_id {} in record",
                    block_id
                )));
            }
        }
    }

    Ok(BlockRefScan::Complete(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    // Assemble a record with the given block references and main data, the
    // way XLogRecordAssemble lays it out.
    fn build_record(blocks: &[(u8, Option<RelFileNode>, &[u8])], main_data: &[u8]) -> Vec<u8> {
        let mut body = BytesMut::new();
        for (id, rnode, data) in blocks {
            body.put_u8(*id);
            let mut fork_flags = 0u8;
            if !data.is_empty() {
                fork_flags |= BKPBLOCK_HAS_DATA;
            }
            if rnode.is_none() {
                fork_flags |= BKPBLOCK_SAME_REL;
            }
            body.put_u8(fork_flags);
            body.put_u16_le(data.len() as u16);
            if let Some(rnode) = rnode {
                rnode.encode(&mut body);
            }
            body.put_u32_le(7); // block number
        }
        if !main_data.is_empty() {
            body.put_u8(XLR_BLOCK_ID_DATA_SHORT);
            body.put_u8(main_data.len() as u8);
        }
        for (_, _, data) in blocks {
            body.put_slice(data);
        }
        body.put_slice(main_data);

        let hdr = XLogRecord {
            xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32,
            xl_xid: 1234,
            xl_prev: 0x1500000,
            xl_info: 0x00,
            xl_rmid: RM_HEAP_ID,
            xl_crc: 0,
        };
        let mut rec = BytesMut::new();
        hdr.encode(&mut rec);
        rec.extend_from_slice(&body);
        rec.to_vec()
    }

    const NODE_A: RelFileNode = RelFileNode {
        spcnode: 1663,
        dbnode: 5,
        relnode: 16384,
    };
    const NODE_B: RelFileNode = RelFileNode {
        spcnode: 16385,
        dbnode: 5,
        relnode: 16390,
    };

    #[test]
    fn scan_two_blocks_with_same_rel() {
        let rec = build_record(
            &[
                (0, Some(NODE_A), b"tuple data"),
                (1, None, b"more"),
                (2, Some(NODE_B), b""),
            ],
            b"main",
        );
        match scan_rel_file_nodes(&rec).unwrap() {
            BlockRefScan::Complete(nodes) => assert_eq!(nodes, vec![NODE_A, NODE_A, NODE_B]),
            other => panic!("expected complete scan, got {other:?}"),
        }
    }

    #[test]
    fn scan_record_without_blocks() {
        let rec = build_record(&[], b"commit payload");
        match scan_rel_file_nodes(&rec).unwrap() {
            BlockRefScan::Complete(nodes) => assert!(nodes.is_empty()),
            other => panic!("expected complete scan, got {other:?}"),
        }
    }

    #[test]
    fn scan_needs_more_bytes() {
        let rec = build_record(&[(0, Some(NODE_A), b"xyz")], b"");
        // header only: must ask for more
        match scan_rel_file_nodes(&rec[..XLOG_SIZE_OF_XLOG_RECORD]).unwrap() {
            BlockRefScan::NeedMore(n) => assert!(n > XLOG_SIZE_OF_XLOG_RECORD),
            other => panic!("expected NeedMore, got {other:?}"),
        }
        // truncated in the middle of the RelFileNode
        match scan_rel_file_nodes(&rec[..XLOG_SIZE_OF_XLOG_RECORD + 8]).unwrap() {
            BlockRefScan::NeedMore(n) => {
                // everything up to and including the block number is needed
                assert_eq!(n, XLOG_SIZE_OF_XLOG_RECORD + 1 + 1 + 2 + 12);
            }
            other => panic!("expected NeedMore, got {other:?}"),
        }
        // the full header region suffices; the data payload is not needed
        let header_region = XLOG_SIZE_OF_XLOG_RECORD + 1 + 1 + 2 + 12 + 4;
        match scan_rel_file_nodes(&rec[..header_region]).unwrap() {
            BlockRefScan::Complete(nodes) => assert_eq!(nodes, vec![NODE_A]),
            other => panic!("expected complete scan, got {other:?}"),
        }
    }

    #[test]
    fn scan_rejects_same_rel_without_previous() {
        let rec = build_record(&[(0, None, b"data")], b"");
        scan_rel_file_nodes(&rec).unwrap_err();
    }

    #[test]
    fn scan_rejects_garbage_block_id() {
        let mut rec = build_record(&[], b"x");
        rec[XLOG_SIZE_OF_XLOG_RECORD] = 200; // neither a block ref nor a data header
        scan_rel_file_nodes(&rec).unwrap_err();
    }

    #[test]
    fn scan_with_partial_prefix_converges() {
        // feeding one byte more at a time must monotonically reach Complete
        let rec = build_record(&[(0, Some(NODE_A), b"abc"), (1, Some(NODE_B), b"")], b"m");
        let mut len = 0;
        loop {
            match scan_rel_file_nodes(&rec[..len]).unwrap() {
                BlockRefScan::NeedMore(n) => {
                    assert!(n > len, "scan must make progress");
                    len = n;
                }
                BlockRefScan::Complete(nodes) => {
                    assert_eq!(nodes, vec![NODE_A, NODE_B]);
                    break;
                }
            }
        }
    }
}
