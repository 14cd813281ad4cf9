//! Splitting identifier lists into request-sized batches.

use crate::error::{FetchError, Result};

/// Largest journal-code list observed to pass the warehouse's array limit
pub const DEFAULT_JOURNAL_CHUNK: usize = 4000;

/// Largest publication-id list observed to pass the warehouse's array limit
pub const DEFAULT_ENTITY_CHUNK: usize = 300_000;

/// Check a configured chunk size.
///
/// Zero or negative sizes are a configuration error. Signed input is accepted
/// because the value usually comes straight from a CLI flag or config file.
pub fn validate_chunk_size(size: i64) -> Result<usize> {
    if size <= 0 {
        return Err(FetchError::Config(format!(
            "Bad chunk size {}: must be a positive integer",
            size
        )));
    }
    usize::try_from(size).map_err(|_| FetchError::Config(format!("Chunk size {} too large", size)))
}

/// Partition `items` into contiguous batches of at most `size` elements.
///
/// A size larger than the list yields a single batch. An empty list yields no
/// batches.
pub fn chunk<T>(items: &[T], size: usize) -> Result<Vec<&[T]>> {
    if size == 0 {
        return Err(FetchError::Config("Bad chunk size 0".to_string()));
    }
    Ok(items.chunks(size).collect())
}

/// Number of batches `chunk` would produce
pub fn batch_count(len: usize, size: usize) -> usize {
    if size == 0 {
        0
    } else {
        len.div_ceil(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{:04}-{:04}", i, i)).collect()
    }

    #[test]
    fn test_example_batches() -> Result<()> {
        let input = vec![
            "1111-2222".to_string(),
            "3333-4444".to_string(),
            "5555-6666".to_string(),
        ];
        let batches = chunk(&input, 2)?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], &input[..2]);
        assert_eq!(batches[1], &["5555-6666".to_string()][..]);
        Ok(())
    }

    #[test]
    fn test_concatenation_preserves_input() -> Result<()> {
        for len in [1, 2, 7, 10, 33] {
            let input = ids(len);
            for size in 1..=len + 2 {
                let batches = chunk(&input, size)?;
                assert_eq!(batches.len(), batch_count(len, size));
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
                let joined: Vec<String> = batches.concat();
                assert_eq!(joined, input);
            }
        }
        Ok(())
    }

    #[test]
    fn test_oversized_chunk_is_single_batch() -> Result<()> {
        let input = ids(5);
        let batches = chunk(&input, DEFAULT_JOURNAL_CHUNK)?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        Ok(())
    }

    #[test]
    fn test_empty_input_has_no_batches() -> Result<()> {
        let input: Vec<String> = Vec::new();
        assert!(chunk(&input, 3)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(validate_chunk_size(0), Err(FetchError::Config(_))));
        assert!(matches!(validate_chunk_size(-4), Err(FetchError::Config(_))));
        assert_eq!(validate_chunk_size(4000).ok(), Some(4000));
        assert!(chunk(&ids(3), 0).is_err());
    }
}
