use crate::SynthesisError;

const MAX_LABEL_VALUE: usize = 63;

/// A resolved container image reference: repository plus tag (`latest` when omitted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    raw: String,
    repository: String,
    tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, SynthesisError> {
        let raw = reference.trim();
        if raw.is_empty() {
            return Err(SynthesisError::ImageUnresolved(reference.to_string(), "empty reference"));
        }
        // Digests do not name a version; the tag (if any) sits before '@'.
        let named = raw.split_once('@').map(|(n, _)| n).unwrap_or(raw);
        let last_slash = named.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match named[last_slash..].rfind(':') {
            Some(i) => (&named[..last_slash + i], &named[last_slash + i + 1..]),
            None => (named, "latest"),
        };
        if repository.is_empty() {
            return Err(SynthesisError::ImageUnresolved(reference.to_string(), "empty repository"));
        }
        if tag.is_empty() {
            return Err(SynthesisError::ImageUnresolved(reference.to_string(), "empty tag"));
        }
        if tag.len() > MAX_LABEL_VALUE {
            return Err(SynthesisError::ImageUnresolved(reference.to_string(), "tag too long for a label value"));
        }
        if !is_label_value(tag) {
            return Err(SynthesisError::ImageUnresolved(reference.to_string(), "tag is not a valid label value"));
        }
        Ok(Self { raw: raw.to_string(), repository: repository.to_string(), tag: tag.to_string() })
    }

    /// The reference as given to the container runtime.
    pub fn as_str(&self) -> &str { &self.raw }
    pub fn repository(&self) -> &str { &self.repository }
    pub fn tag(&self) -> &str { &self.tag }
}

/// `[A-Za-z0-9_.-]`, starting and ending alphanumeric; the tag doubles as the version label.
fn is_label_value(v: &str) -> bool {
    let bytes = v.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}
