// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::enc::write::Writer;

/// Upper bound for a single encoded structure. Equal to the consensus
/// `MAX_DATA_LEN`: nothing larger ever crosses the wire or enters a hash.
pub const CODEC_BYTES_LIMIT: usize = 1024 * 1024;

pub fn encode_to_vec<T: bincode::Encode>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let config = bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .skip_fixed_array_length()
        .with_limit::<CODEC_BYTES_LIMIT>();

    bincode::encode_to_vec(val, config)
}

pub fn encode<W: Writer, T: bincode::Encode>(
    writer: W,
    val: &T,
) -> Result<(), bincode::error::EncodeError> {
    let config = bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .skip_fixed_array_length()
        .with_limit::<CODEC_BYTES_LIMIT>();

    bincode::encode_into_writer(val, writer, config)
}

pub fn decode<T: bincode::Decode>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    let config = bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .skip_fixed_array_length()
        .with_limit::<CODEC_BYTES_LIMIT>();

    bincode::decode_from_slice(bytes, config).map(|r| r.0)
}

/// Hex helpers used at the RPC boundary.
pub fn encode_to_hex<T: bincode::Encode>(val: &T) -> Result<String, bincode::error::EncodeError> {
    Ok(hex::encode(encode_to_vec(val)?))
}

pub fn decode_from_hex<T: bincode::Decode>(s: &str) -> Result<T, &'static str> {
    let bytes = hex::decode(s).map_err(|_| "invalid hex")?;
    decode(&bytes).map_err(|_| "invalid encoding")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::{Decode, Encode};

    #[derive(Encode, Decode, PartialEq, Debug)]
    enum TestEnum {
        A(u32),
        B(u32),
    }

    #[test]
    fn test_single_byte_enum_variant() {
        let encoded = encode_to_vec(&TestEnum::B(0)).unwrap();
        assert_eq!(encoded.as_slice(), &[1, 0]);
    }

    #[test]
    fn test_single_byte_vec_u8() {
        let input: Vec<u8> = vec![0xff, 0xff];
        let encoded = encode_to_vec(&input).unwrap();
        assert_eq!(encoded.as_slice(), &[0x02, 0xff, 0xff]);
    }

    #[test]
    fn test_hex_round_trip() {
        let val = TestEnum::A(42);
        let hexed = encode_to_hex(&val).unwrap();
        let back: TestEnum = decode_from_hex(&hexed).unwrap();
        assert_eq!(back, val);
    }
}
