//! WAV encoding for clips that are downloaded rather than streamed.

use crate::audio::error::{AudioError, AudioResult};
use crate::audio::pcm::AudioChunk;
use std::io::Cursor;

/// Encode a mono PCM16 chunk as a complete RIFF/WAV file.
pub fn encode_wav(chunk: &AudioChunk) -> AudioResult<Vec<u8>> {
    if chunk.is_empty() {
        return Err(AudioError::DecodeFailed("no samples to encode".to_string()));
    }

    let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, chunk.sample_rate, 16);
    let track = wav::BitDepth::Sixteen(chunk.samples.to_vec());

    let mut out = Cursor::new(Vec::with_capacity(44 + chunk.samples.len() * 2));
    wav::write(header, &track, &mut out)
        .map_err(|e| AudioError::DecodeFailed(format!("WAV encoding failed: {}", e)))?;

    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_and_payload() {
        let chunk = AudioChunk::new(vec![1, -1, 300, -300], 24_000, 0);
        let bytes = encode_wav(&chunk).unwrap();

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // header + 4 samples * 2 bytes
        assert!(bytes.len() >= 44 + 8);

        let (header, data) = wav::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.sampling_rate, 24_000);
        assert_eq!(header.channel_count, 1);
        assert_eq!(data.as_sixteen().unwrap(), &vec![1, -1, 300, -300]);
    }

    #[test]
    fn test_empty_chunk_rejected() {
        let chunk = AudioChunk::new(Vec::new(), 24_000, 0);
        assert!(matches!(encode_wav(&chunk), Err(AudioError::DecodeFailed(_))));
    }
}
