use crate::task::Chunk;

pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 1_048_576;

/// Partitions `[0, total_size)` into contiguous, non-overlapping chunks.
///
/// Pure and deterministic: no I/O. Mirrors the chunking rule used throughout
/// the corpus this engine was derived from, generalized to a standalone
/// function so it can be property-tested independent of any transfer.
pub fn plan(total_size: u64, requested_connections: u32, min_chunk_size: u64) -> Vec<Chunk> {
    if total_size == 0 {
        return Vec::new();
    }

    if total_size < min_chunk_size {
        return vec![Chunk::new(0, total_size - 1)];
    }

    let mut chunk_count = requested_connections.max(1) as u64;
    let mut chunk_size = total_size / chunk_count;

    if chunk_size < min_chunk_size {
        chunk_count = (total_size / min_chunk_size).max(1);
        chunk_size = total_size / chunk_count;
    }

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for i in 0..chunk_count {
        let start = i * chunk_size;
        let end = if i == chunk_count - 1 {
            total_size - 1
        } else {
            (i + 1) * chunk_size - 1
        };
        chunks.push(Chunk::new(start, end));
    }
    chunks
}

/// Convenience wrapper using the default 1 MiB floor.
pub fn plan_default(total_size: u64, requested_connections: u32) -> Vec<Chunk> {
    plan(total_size, requested_connections, DEFAULT_MIN_CHUNK_SIZE)
}

// Property tests (contiguity, coverage, the min-chunk-size floor) live in
// engine/tests/planner_properties.rs since they exercise the public API the
// same way a caller would.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_yields_one_chunk() {
        let chunks = plan(1, 8, DEFAULT_MIN_CHUNK_SIZE);
        assert_eq!(chunks, vec![Chunk::new(0, 0)]);
    }
}
