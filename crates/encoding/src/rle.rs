//! Run-length codec matching the GBA BIOS `RLUnCompReadNormalWrite8/16`
//! wire format used by the `SWI 0x14` HLE handler.
//!
//! Layout: a four-byte header (`data_size << 8 | 0x03`) followed by a
//! stream of flag bytes. A flag with the high bit clear introduces
//! `(flag & 0x7f) + 1` literal bytes copied verbatim; a flag with the
//! high bit set introduces a single byte repeated `(flag & 0x7f) + 3`
//! times.

use oxidegba_common::error::Error;

use crate::codec::Codec;

const RLE_TYPE: u8 = 0x03;

pub struct Rle;

impl Codec for Rle {
    type EncodeOptions = ();
    type DecodeOptions = ();

    fn encode(data: &[u8], _options: &Self::EncodeOptions) -> Result<Vec<u8>, Error> {
        if data.len() > 0x00ff_ffff {
            return Err(Error::InvalidParameter(String::from(
                "RLE input exceeds 24-bit size field",
            )));
        }

        let mut encoded = Vec::new();
        encoded.push(RLE_TYPE);
        encoded.extend_from_slice(&(data.len() as u32).to_le_bytes()[1..]);

        let mut index = 0;
        let mut literal_run: Vec<u8> = Vec::new();

        let flush_literal = |literal_run: &mut Vec<u8>, encoded: &mut Vec<u8>| {
            let mut offset = 0;
            while offset < literal_run.len() {
                let chunk_len = (literal_run.len() - offset).min(128);
                encoded.push((chunk_len - 1) as u8);
                encoded.extend_from_slice(&literal_run[offset..offset + chunk_len]);
                offset += chunk_len;
            }
            literal_run.clear();
        };

        while index < data.len() {
            let byte = data[index];
            let mut run_len = 1;
            while index + run_len < data.len() && data[index + run_len] == byte && run_len < 130 {
                run_len += 1;
            }

            if run_len >= 3 {
                flush_literal(&mut literal_run, &mut encoded);
                encoded.push(0x80 | (run_len as u8 - 3));
                encoded.push(byte);
                index += run_len;
            } else {
                literal_run.push(byte);
                index += 1;
                if literal_run.len() == 128 {
                    flush_literal(&mut literal_run, &mut encoded);
                }
            }
        }
        flush_literal(&mut literal_run, &mut encoded);

        Ok(encoded)
    }

    fn decode(data: &[u8], _options: &Self::DecodeOptions) -> Result<Vec<u8>, Error> {
        if data.len() < 4 {
            return Err(Error::InvalidData);
        }
        if data[0] & 0x0f != RLE_TYPE {
            return Err(Error::InvalidData);
        }

        let size = u32::from_le_bytes([data[1], data[2], data[3], 0]) as usize;
        let mut decoded = Vec::with_capacity(size);
        let mut cursor = 4;

        while decoded.len() < size {
            let flag = *data.get(cursor).ok_or(Error::InvalidData)?;
            cursor += 1;

            if flag & 0x80 == 0 {
                let count = (flag & 0x7f) as usize + 1;
                let chunk = data.get(cursor..cursor + count).ok_or(Error::InvalidData)?;
                decoded.extend_from_slice(chunk);
                cursor += count;
            } else {
                let count = (flag & 0x7f) as usize + 3;
                let byte = *data.get(cursor).ok_or(Error::InvalidData)?;
                cursor += 1;
                decoded.resize(decoded.len() + count, byte);
            }
        }

        decoded.truncate(size);
        Ok(decoded)
    }
}

pub fn encode_rle(data: &[u8]) -> Result<Vec<u8>, Error> {
    Rle::encode(data, &())
}

pub fn decode_rle(data: &[u8]) -> Result<Vec<u8>, Error> {
    Rle::decode(data, &())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_mixed() {
        let original = [1u8, 2, 3, 3, 3, 3, 3, 7, 7, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9];
        let encoded = encode_rle(&original).unwrap();
        let decoded = decode_rle(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_empty() {
        let encoded = encode_rle(&[]).unwrap();
        let decoded = decode_rle(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_rejects_wrong_type() {
        let bad = [0x01, 0x00, 0x00, 0x00];
        assert!(decode_rle(&bad).is_err());
    }
}
