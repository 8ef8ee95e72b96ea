//! Physical-log record and operation codecs.
//!
//! A log record is one header BB followed by `bbs(h_len)` data BBs. The
//! writer steals the first word of every data BB (so a torn write is
//! detectable by its stale cycle) and stashes the stolen words in the
//! header's cycle-data table; [`unpack_record`] puts them back.

use xrec_types::{
    BBSIZE, Cycle, Lsn, ParseError, TransactionId, bytes_to_bbs, read_be_u32, read_be_u64,
    read_fixed, write_be_u32, write_be_u64,
};

/// Magic number identifying a log record header BB.
pub const RECORD_MAGIC: u32 = 0xFEED_BABE;

/// Maximum number of in-core log buffers a writer can have outstanding.
pub const MAX_ICLOGS: u32 = 8;
/// log2 of the maximum record data size.
pub const MAX_RECORD_BSHIFT: u32 = 15;
/// Maximum record data size in bytes.
pub const MAX_RECORD_BSIZE: u32 = 1 << MAX_RECORD_BSHIFT;
/// Cycle-data words in a record header: one per possible data BB.
pub const CYCLE_DATA_WORDS: usize = (MAX_RECORD_BSIZE as usize) / BBSIZE;

const OFF_MAGIC: usize = 0;
const OFF_CYCLE: usize = 4;
const OFF_VERSION: usize = 8;
const OFF_LEN: usize = 12;
const OFF_LSN: usize = 16;
const OFF_TAIL_LSN: usize = 24;
const OFF_CHKSUM: usize = 32;
const OFF_PREV_BLOCK: usize = 36;
const OFF_NUM_LOGOPS: usize = 40;
const OFF_FS_UUID: usize = 44;
const OFF_CYCLE_DATA: usize = 60;

/// Size of a log operation header on disk.
pub const OP_HEADER_SIZE: usize = 12;

/// Magic carried by the first region of every transaction ("TRAN").
pub const TRANS_HEADER_MAGIC: u32 = 0x5452_414E;
/// On-disk size of the transaction header region.
pub const TRANS_HEADER_SIZE: usize = 16;

/// Operation originator recorded in the op header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientId {
    Transaction,
    Log,
}

impl ClientId {
    pub const TRANSACTION: u8 = 0x69;
    pub const LOG: u8 = 0xAA;

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            Self::TRANSACTION => Some(Self::Transaction),
            Self::LOG => Some(Self::Log),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Transaction => Self::TRANSACTION,
            Self::Log => Self::LOG,
        }
    }
}

/// Log operation flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(pub u8);

impl OpFlags {
    pub const START: u8 = 0x01;
    pub const COMMIT: u8 = 0x02;
    pub const CONTINUE: u8 = 0x04;
    pub const WAS_CONT: u8 = 0x08;
    pub const END: u8 = 0x10;
    pub const UNMOUNT: u8 = 0x20;

    const KNOWN: u8 = Self::START
        | Self::COMMIT
        | Self::CONTINUE
        | Self::WAS_CONT
        | Self::END
        | Self::UNMOUNT;

    #[must_use]
    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    /// Flags with the END bit masked off, and CONTINUE cleared when
    /// WAS_CONT is set — the state the replay dispatch switches on.
    #[must_use]
    pub fn dispatch_state(self) -> u8 {
        let mut state = self.0 & !Self::END;
        if state & Self::WAS_CONT != 0 {
            state &= !Self::CONTINUE;
        }
        state
    }

    #[must_use]
    pub fn is_known(self) -> bool {
        self.0 & !Self::KNOWN == 0
    }
}

/// Decoded log record header (one BB on disk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub cycle: Cycle,
    pub version: u32,
    pub len: u32,
    pub lsn: Lsn,
    pub tail_lsn: Lsn,
    pub chksum: u32,
    pub prev_block: u32,
    pub num_logops: u32,
    pub fs_uuid: [u8; 16],
    pub cycle_data: [u32; CYCLE_DATA_WORDS],
}

impl RecordHeader {
    /// Parse a record header from its BB. Fails on a wrong magic.
    pub fn parse(bb: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(bb, OFF_MAGIC)?;
        if magic != RECORD_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(RECORD_MAGIC),
                actual: u64::from(magic),
            });
        }
        let len = read_be_u32(bb, OFF_LEN)?;
        if len > MAX_RECORD_BSIZE {
            return Err(ParseError::InvalidField {
                field: "h_len",
                reason: "exceeds maximum record size",
            });
        }
        let mut cycle_data = [0_u32; CYCLE_DATA_WORDS];
        for (i, word) in cycle_data.iter_mut().enumerate() {
            *word = read_be_u32(bb, OFF_CYCLE_DATA + i * 4)?;
        }
        Ok(Self {
            cycle: Cycle(read_be_u32(bb, OFF_CYCLE)?),
            version: read_be_u32(bb, OFF_VERSION)?,
            len,
            lsn: Lsn(read_be_u64(bb, OFF_LSN)?),
            tail_lsn: Lsn(read_be_u64(bb, OFF_TAIL_LSN)?),
            chksum: read_be_u32(bb, OFF_CHKSUM)?,
            prev_block: read_be_u32(bb, OFF_PREV_BLOCK)?,
            num_logops: read_be_u32(bb, OFF_NUM_LOGOPS)?,
            fs_uuid: read_fixed::<16>(bb, OFF_FS_UUID)?,
            cycle_data,
        })
    }

    /// Encode this header into its BB.
    pub fn encode_into(&self, bb: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(bb, OFF_MAGIC, RECORD_MAGIC)?;
        write_be_u32(bb, OFF_CYCLE, self.cycle.0)?;
        write_be_u32(bb, OFF_VERSION, self.version)?;
        write_be_u32(bb, OFF_LEN, self.len)?;
        write_be_u64(bb, OFF_LSN, self.lsn.0)?;
        write_be_u64(bb, OFF_TAIL_LSN, self.tail_lsn.0)?;
        write_be_u32(bb, OFF_CHKSUM, self.chksum)?;
        write_be_u32(bb, OFF_PREV_BLOCK, self.prev_block)?;
        write_be_u32(bb, OFF_NUM_LOGOPS, self.num_logops)?;
        bb[OFF_FS_UUID..OFF_FS_UUID + 16].copy_from_slice(&self.fs_uuid);
        for (i, word) in self.cycle_data.iter().enumerate() {
            write_be_u32(bb, OFF_CYCLE_DATA + i * 4, *word)?;
        }
        Ok(())
    }

    /// Number of data BBs following the header.
    #[must_use]
    pub fn data_bbs(&self) -> u32 {
        bytes_to_bbs(self.len)
    }
}

/// Is this BB a record header?
#[must_use]
pub fn is_record_header(bb: &[u8]) -> bool {
    read_be_u32(bb, OFF_MAGIC) == Ok(RECORD_MAGIC)
}

/// Cycle stamped into the first word of a written BB.
pub fn bb_cycle(bb: &[u8]) -> Result<Cycle, ParseError> {
    read_be_u32(bb, 0).map(Cycle)
}

/// Decoded log operation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub tid: TransactionId,
    pub len: u32,
    pub clientid: u8,
    pub flags: OpFlags,
}

impl OpHeader {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            tid: TransactionId(read_be_u32(data, offset)?),
            len: read_be_u32(data, offset + 4)?,
            clientid: xrec_types::ensure_slice(data, offset + 8, 1)?[0],
            flags: OpFlags(xrec_types::ensure_slice(data, offset + 9, 1)?[0]),
        })
    }

    pub fn encode_into(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(data, offset, self.tid.0)?;
        write_be_u32(data, offset + 4, self.len)?;
        xrec_types::ensure_slice(data, offset + 8, 4)?;
        data[offset + 8] = self.clientid;
        data[offset + 9] = self.flags.0;
        data[offset + 10] = 0;
        data[offset + 11] = 0;
        Ok(())
    }
}

/// Reinject the stolen first words into a record's data area.
///
/// Inverse of [`pack_record`]; after this the data bytes read exactly as the
/// writer produced them.
pub fn unpack_record(header: &RecordHeader, data: &mut [u8]) -> Result<(), ParseError> {
    let bbs = header.data_bbs() as usize;
    if bbs > CYCLE_DATA_WORDS {
        return Err(ParseError::InvalidField {
            field: "h_len",
            reason: "more data blocks than cycle-data words",
        });
    }
    for i in 0..bbs {
        write_be_u32(data, i * BBSIZE, header.cycle_data[i])?;
    }
    Ok(())
}

/// Steal the first word of every data BB into the header's cycle-data table
/// and stamp the record cycle in its place, the way the log writer does.
pub fn pack_record(header: &mut RecordHeader, data: &mut [u8]) -> Result<(), ParseError> {
    let bbs = header.data_bbs() as usize;
    if bbs > CYCLE_DATA_WORDS {
        return Err(ParseError::InvalidField {
            field: "h_len",
            reason: "more data blocks than cycle-data words",
        });
    }
    for i in 0..bbs {
        header.cycle_data[i] = read_be_u32(data, i * BBSIZE)?;
        write_be_u32(data, i * BBSIZE, header.cycle.0)?;
    }
    header.chksum = record_chksum(&data[..header.len as usize]);
    Ok(())
}

/// Record body checksum: XOR of the payload's big-endian words.
#[must_use]
pub fn record_chksum(data: &[u8]) -> u32 {
    let mut chksum = 0_u32;
    for word in data.chunks_exact(4) {
        chksum ^= u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    }
    chksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrec_types::LogBlock;

    fn sample_header(len: u32) -> RecordHeader {
        RecordHeader {
            cycle: Cycle(3),
            version: 2,
            len,
            lsn: Lsn::new(Cycle(3), LogBlock(17)),
            tail_lsn: Lsn::new(Cycle(3), LogBlock(5)),
            chksum: 0,
            prev_block: 12,
            num_logops: 4,
            fs_uuid: [0xAB; 16],
            cycle_data: [0_u32; CYCLE_DATA_WORDS],
        }
    }

    #[test]
    fn header_codec_round_trip() {
        let header = sample_header(1536);
        let mut bb = [0_u8; BBSIZE];
        header.encode_into(&mut bb).expect("encode");
        assert!(is_record_header(&bb));

        let back = RecordHeader::parse(&bb).expect("parse");
        assert_eq!(back, header);
        assert_eq!(back.data_bbs(), 3);
    }

    #[test]
    fn header_parse_rejects_bad_magic() {
        let bb = [0_u8; BBSIZE];
        assert!(matches!(
            RecordHeader::parse(&bb),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn header_parse_rejects_oversized_len() {
        let mut bb = [0_u8; BBSIZE];
        sample_header(100).encode_into(&mut bb).expect("encode");
        write_be_u32(&mut bb, OFF_LEN, MAX_RECORD_BSIZE + 1).expect("poke len");
        assert!(RecordHeader::parse(&bb).is_err());
    }

    #[test]
    fn pack_unpack_round_trip() {
        // P4: unpack(pack(data)) == data, and packed BBs carry the cycle.
        let mut header = sample_header(BBSIZE as u32 * 2);
        let mut data: Vec<u8> = (0..BBSIZE * 2).map(|i| (i % 251) as u8).collect();
        let original = data.clone();

        pack_record(&mut header, &mut data).expect("pack");
        assert_eq!(bb_cycle(&data).expect("cycle"), Cycle(3));
        assert_eq!(bb_cycle(&data[BBSIZE..]).expect("cycle"), Cycle(3));
        assert_ne!(data, original);

        unpack_record(&header, &mut data).expect("unpack");
        assert_eq!(data, original);
    }

    #[test]
    fn op_header_codec_round_trip() {
        let op = OpHeader {
            tid: TransactionId(0xDEAD_BEEF),
            len: 48,
            clientid: ClientId::TRANSACTION,
            flags: OpFlags(OpFlags::START | OpFlags::END),
        };
        let mut buf = [0_u8; 16];
        op.encode_into(&mut buf, 2).expect("encode");
        let back = OpHeader::parse(&buf, 2).expect("parse");
        assert_eq!(back, op);
    }

    #[test]
    fn dispatch_state_clears_end_and_continue() {
        let flags = OpFlags(OpFlags::WAS_CONT | OpFlags::CONTINUE | OpFlags::END);
        assert_eq!(flags.dispatch_state(), OpFlags::WAS_CONT);
        assert!(flags.is_known());
        assert!(!OpFlags(0x40).is_known());
    }
}
