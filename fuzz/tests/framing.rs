//! Bolero fuzzer for streaming frame reassembly.
//!
//! Properties tested:
//! - Chunk boundaries never change what messages come out
//! - Back-to-back messages separate correctly
//! - The parser consumes exactly the bytes it was given

use bolero::check;
use capstan_fuzz::framing_model::execute_and_verify;

fn main() {
    check!()
        .with_type::<(Vec<Vec<u8>>, Vec<u8>)>()
        .for_each(|(specs, chunk_sizes)| {
            // Bound the work per input: a handful of messages, small bodies.
            let specs: Vec<Vec<u8>> = specs.iter().take(4).cloned().collect();
            if let Err(e) = execute_and_verify(&specs, chunk_sizes) {
                panic!("framing invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    #![allow(unused_imports)]
    use capstan_fuzz::framing_model::execute_and_verify;

    #[test]
    fn seeds() {
        execute_and_verify(&[vec![1, 2]], &[1]).unwrap();
        execute_and_verify(&[vec![0], vec![3]], &[2, 9]).unwrap();
    }
}
