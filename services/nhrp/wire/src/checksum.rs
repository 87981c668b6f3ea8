//! Internet checksum (RFC 1071).

/// Compute the 16-bit one's complement checksum of `data`
///
/// Words are read big-endian; an odd trailing byte is padded with zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Whether `data` (checksum field included) sums to zero
pub fn verify(data: &[u8]) -> bool {
    checksum(data) == 0
}
