use coap_lite::{CoapOption, Packet};

/// Largest block number representable in a 3-byte Block option value
/// (20 bits of NUM).
pub const MAX_BLOCK_NUM: u32 = 0xF_FFFF;

/// Which of the two RFC7959 options a [`Block`] travels in.
///
/// This tag is load-bearing: Block1 governs request-body segmentation and
/// Block2 governs response-body segmentation, and a single decode call must
/// say which one it matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockType {
  /// The Block1 option (request bodies)
  Block1,
  /// The Block2 option (response bodies)
  Block2,
}

impl BlockType {
  /// The `coap_lite` option this block type is carried in
  pub fn option(&self) -> CoapOption {
    match self {
      | Self::Block1 => CoapOption::Block1,
      | Self::Block2 => CoapOption::Block2,
    }
  }
}

/// Decoded form of a Block1/Block2 option value.
///
/// Three items of information travel in a Block option:
/// * the size of the block ([`Block::size`], always one of the seven
///   powers of two 16..=1024)
/// * whether more blocks follow ([`Block::more`])
/// * the relative number of the block ([`Block::num`]) within a sequence
///   of blocks of that size
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
  /// Whether this was (or will be) carried as Block1 or Block2
  pub ty: BlockType,
  /// Block number (20 bits)
  pub num: u32,
  /// Block size in bytes
  pub size: u16,
  /// The `M` flag: more blocks follow this one
  pub more: bool,
}

/// Errors decoding a Block option out of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DecodeError {
  /// The option is present but its value is empty.
  ///
  /// A zero-length Block value never occurs in well-formed LwM2M traffic
  /// and is treated as a malformed message, not as "block 0".
  EmptyValue,
  /// The option value is longer than the 3-byte envelope
  TooLong,
  /// SZX 7 is reserved by RFC7959
  BadSzx,
}

/// Errors encoding a [`Block`] into option bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncodeError {
  /// `size` is not one of {16, 32, 64, 128, 256, 512, 1024}
  BadSize,
  /// `num` does not fit in the 20 bits a 3-byte option can carry
  NumTooBig,
}

impl Block {
  /// A block descriptor, unvalidated until [`Block::encode`]
  pub fn new(ty: BlockType, num: u32, size: u16, more: bool) -> Self {
    Block { ty, num, size, more }
  }

  /// Scan `packet` for a Block1 option, then for Block2; decode whichever
  /// is present.
  ///
  /// `Ok(None)` means no block transfer is in use, which is not an error.
  pub fn decode(packet: &Packet) -> Result<Option<Block>, DecodeError> {
    let present = |ty: BlockType| {
      packet.get_option(ty.option())
            .and_then(|vals| vals.front())
            .map(|v| (ty, v))
    };

    match present(BlockType::Block1).or_else(|| present(BlockType::Block2)) {
      | None => Ok(None),
      | Some((ty, value)) => Self::from_value(ty, value).map(Some),
    }
  }

  /// Decode a raw 1-3 byte option value
  pub fn from_value(ty: BlockType, value: &[u8]) -> Result<Block, DecodeError> {
    let last = match value {
      | [] => return Err(DecodeError::EmptyValue),
      | v if v.len() > 3 => return Err(DecodeError::TooLong),
      | v => v[v.len() - 1],
    };

    let szx = (last & 0b111) as u32;
    if szx == 7 {
      return Err(DecodeError::BadSzx);
    }

    // NUM is everything above the low nibble of the last byte,
    // big-endian across the preceding bytes
    let num = value.iter()
                   .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
              >> 4;

    Ok(Block { ty,
               num,
               size: 1 << (szx + 4),
               more: last & 0b1000 != 0 })
  }

  /// Encode into the minimal 1-3 byte option value.
  ///
  /// Fails when `size` is not a valid SZX codepoint or `num` exceeds
  /// [`MAX_BLOCK_NUM`]; an out-of-range number is never silently
  /// truncated.
  pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
    let szx = self.szx()?;

    if self.num > MAX_BLOCK_NUM {
      return Err(EncodeError::NumTooBig);
    }

    let raw = (self.num << 4) | (u32::from(self.more) << 3) | szx;

    let bytes = match self.num {
      | n if n <= 0xF => vec![raw as u8],
      | n if n <= 0xFFF => (raw as u16).to_be_bytes().to_vec(),
      | _ => raw.to_be_bytes()[1..].to_vec(),
    };

    Ok(bytes)
  }

  /// Replace the matching Block option on `packet` with this descriptor
  pub fn apply(&self, packet: &mut Packet) -> Result<(), EncodeError> {
    let bytes = self.encode()?;
    packet.clear_option(self.ty.option());
    packet.add_option(self.ty.option(), bytes);
    Ok(())
  }

  /// The SZX codepoint for [`Block::size`], `size = 2^(SZX + 4)`
  pub fn szx(&self) -> Result<u32, EncodeError> {
    match self.size {
      | 16 => Ok(0),
      | 32 => Ok(1),
      | 64 => Ok(2),
      | 128 => Ok(3),
      | 256 => Ok(4),
      | 512 => Ok(5),
      | 1024 => Ok(6),
      | _ => Err(EncodeError::BadSize),
    }
  }
}
