use crate::types::Chunk;

/// Split `recipients` into consecutive chunks of at most `chunk_size`, keeping
/// input order. The chunk index is the durable key retries are correlated by,
/// so the partition must depend on nothing but the inputs.
pub fn plan_chunks(recipients: &[String], chunk_size: usize) -> Vec<Chunk> {
    let size = chunk_size.max(1);
    let total = recipients.len().div_ceil(size);

    recipients
        .chunks(size)
        .enumerate()
        .map(|(index, slice)| Chunk {
            index,
            total,
            recipients: slice.to_vec(),
        })
        .collect()
}

pub fn chunk_count(recipient_count: usize, chunk_size: usize) -> usize {
    recipient_count.div_ceil(chunk_size.max(1))
}
