//! Chunked reads over stored artefacts.
//!
//! Deployment artefacts are fetched as a stream of chunks; a digest change
//! between consecutive chunks marks the boundary between files. The reader
//! here serves one artefact; the service strings readers together per
//! deployment.

use bytes::Bytes;

use parallax_proto::controller::{ArtefactChunk, DeploymentArtefact};

/// Cursor over one artefact's content.
pub struct ArtefactReader {
    artefact: DeploymentArtefact,
    content: Bytes,
    offset: usize,
    chunk_size: usize,
}

impl ArtefactReader {
    #[must_use]
    pub fn new(artefact: DeploymentArtefact, content: Bytes, chunk_size: usize) -> Self {
        Self {
            artefact,
            content,
            offset: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    /// The next chunk, or `None` once the content is exhausted. Empty
    /// artefacts still yield one empty chunk so the receiver learns the
    /// file exists.
    pub fn next_chunk(&mut self) -> Option<ArtefactChunk> {
        if self.content.is_empty() {
            if self.offset > 0 {
                return None;
            }
            self.offset = 1;
            return Some(ArtefactChunk {
                artefact: self.artefact.clone(),
                chunk: Bytes::new(),
            });
        }
        if self.offset >= self.content.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.content.len());
        let chunk = self.content.slice(self.offset..end);
        self.offset = end;
        Some(ArtefactChunk {
            artefact: self.artefact.clone(),
            chunk,
        })
    }
}

impl Iterator for ArtefactReader {
    type Item = ArtefactChunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_proto::Digest;

    fn artefact(content: &[u8]) -> DeploymentArtefact {
        DeploymentArtefact {
            digest: Digest::of(content),
            path: "main".into(),
            executable: true,
        }
    }

    #[test]
    fn chunks_cover_content_exactly() {
        let content = Bytes::from(vec![7u8; 10]);
        let reader = ArtefactReader::new(artefact(&content), content.clone(), 4);
        let chunks: Vec<_> = reader.collect();
        assert_eq!(
            chunks.iter().map(|c| c.chunk.len()).collect::<Vec<_>>(),
            vec![4, 4, 2],
        );
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.chunk.to_vec()).collect();
        assert_eq!(joined, content.to_vec());
    }

    #[test]
    fn empty_artefact_yields_one_empty_chunk() {
        let reader = ArtefactReader::new(artefact(b""), Bytes::new(), 4);
        let chunks: Vec<_> = reader.collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].chunk.is_empty());
    }
}
