//! ICY in-band metadata blocks
//!
//! A block is one length byte `L` followed by `16 * L` bytes of text padded
//! with NUL. An empty block (`L = 0`) means "unchanged".

use bytes::Bytes;

/// Longest text a single block can carry
pub const MAX_METADATA_LEN: usize = 255 * 16;

/// Current stream title plus a version that bumps on every change
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    title: Option<String>,
    version: u64,
    block: Bytes,
}

impl StreamMetadata {
    pub fn new() -> Self {
        Self {
            title: None,
            version: 0,
            block: empty_block(),
        }
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        self.block = format_block(&title);
        self.title = Some(title);
        self.version += 1;
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Block to send to a client that last saw `seen_version`
    pub fn block_for(&self, seen_version: u64) -> Bytes {
        if seen_version < self.version {
            self.block.clone()
        } else {
            empty_block()
        }
    }
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_block() -> Bytes {
    Bytes::from_static(&[0])
}

/// `StreamTitle='...';` framed as an ICY block
pub fn format_block(title: &str) -> Bytes {
    // A quote would end the field early
    let title = title.replace('\'', "");
    let mut text = format!("StreamTitle='{}';", title);
    if text.len() > MAX_METADATA_LEN {
        let mut cut = MAX_METADATA_LEN - 2;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("';");
    }

    let padded_len = text.len().div_ceil(16) * 16;
    let mut block = Vec::with_capacity(1 + padded_len);
    block.push((padded_len / 16) as u8);
    block.extend_from_slice(text.as_bytes());
    block.resize(1 + padded_len, 0);
    Bytes::from(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_framing() {
        let block = format_block("Artist - Song");
        // "StreamTitle='Artist - Song';" is 28 bytes -> padded to 32
        assert_eq!(block[0], 2);
        assert_eq!(block.len(), 33);
        assert!(block[1..].starts_with(b"StreamTitle='Artist - Song';"));
        assert!(block[29..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exact_multiple_is_not_overpadded() {
        // 15 bytes of framing + 1 of title = 16
        let block = format_block("a");
        assert_eq!(block[0], 1);
        assert_eq!(block.len(), 17);
    }

    #[test]
    fn test_quotes_are_stripped() {
        let block = format_block("Don't Stop");
        assert!(block[1..].starts_with(b"StreamTitle='Dont Stop';"));
    }

    #[test]
    fn test_oversized_title_is_truncated() {
        let block = format_block(&"x".repeat(5000));
        assert_eq!(block[0], 255);
        assert_eq!(block.len(), 1 + MAX_METADATA_LEN);
        assert!(block.ends_with(b"';"));
    }

    #[test]
    fn test_unchanged_title_sends_empty_block() {
        let mut meta = StreamMetadata::new();
        assert_eq!(meta.block_for(0).as_ref(), &[0]);

        meta.set_title("First");
        assert_eq!(meta.version(), 1);
        assert!(meta.block_for(0).len() > 1);
        assert_eq!(meta.block_for(1).as_ref(), &[0]);

        meta.set_title("Second");
        assert!(meta.block_for(1).len() > 1);
        assert_eq!(meta.title(), Some("Second"));
    }
}
