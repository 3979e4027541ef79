//! Streaming reassembly model for the frame parser.
//!
//! Messages written with `write_message` and concatenated must reassemble
//! identically no matter how the byte stream is sliced into chunks.

use capstan_core::{write_message, FrameParser, BYTES_PER_WORD};

/// Generator description of one message: segment sizes in words (0..=8
/// each, at most 4 segments). Bodies are filled with a deterministic
/// pattern so corruption is observable.
pub type MessageSpec = Vec<u8>;

pub fn build_segments(spec: &MessageSpec, salt: u8) -> Vec<Vec<u8>> {
    let mut segments: Vec<Vec<u8>> = spec
        .iter()
        .take(4)
        .map(|words| {
            let words = (*words % 9) as usize;
            (0..words * BYTES_PER_WORD)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt))
                .collect()
        })
        .collect();
    if segments.is_empty() {
        segments.push(Vec::new());
    }
    segments
}

/// Serialize `specs`, slice the stream at `chunk_sizes` boundaries, feed
/// every chunk, and require exact reassembly.
pub fn execute_and_verify(specs: &[MessageSpec], chunk_sizes: &[u8]) -> Result<(), String> {
    let expected: Vec<Vec<Vec<u8>>> = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| build_segments(spec, i as u8))
        .collect();

    let mut stream = Vec::new();
    for segments in &expected {
        stream.extend_from_slice(&write_message(segments));
    }

    let mut parser = FrameParser::new();
    let mut got = Vec::new();
    let mut at = 0usize;
    let mut chunks = chunk_sizes.iter().cycle();
    while at < stream.len() {
        // Chunk sizes of zero stall the stream without advancing; skip them
        // so the walk terminates.
        let step = (*chunks.next().unwrap_or(&1) as usize).max(1).min(stream.len() - at);
        parser.feed(&stream[at..at + step]);
        at += step;
        loop {
            match parser.next_message() {
                Ok(Some(message)) => got.push(message),
                Ok(None) => break,
                Err(e) => return Err(format!("parser rejected a valid stream: {e}")),
            }
        }
    }

    if got != expected {
        return Err(format!(
            "reassembly mismatch: expected {} messages {:?}, got {} messages {:?}",
            expected.len(),
            expected.iter().map(|m| m.iter().map(Vec::len).collect::<Vec<_>>()).collect::<Vec<_>>(),
            got.len(),
            got.iter().map(|m| m.iter().map(Vec::len).collect::<Vec<_>>()).collect::<Vec<_>>(),
        ));
    }
    if parser.pending() != 0 {
        return Err(format!("{} bytes left unconsumed", parser.pending()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_message_many_splits() {
        for chunk in 1..=17u8 {
            execute_and_verify(&[vec![2, 3]], &[chunk]).unwrap();
        }
    }

    #[test]
    fn multiple_messages_back_to_back() {
        execute_and_verify(
            &[vec![1], vec![2, 2, 2], vec![0], vec![8, 8, 8, 8]],
            &[7, 1, 64],
        )
        .unwrap();
    }

    #[test]
    fn empty_segment_messages() {
        execute_and_verify(&[vec![0, 0], vec![0]], &[3]).unwrap();
    }

    #[test]
    fn chunk_size_cycle_with_zeroes() {
        execute_and_verify(&[vec![4, 1]], &[0, 5, 0, 2]).unwrap();
    }
}
