use sha1::{Digest, Sha1};

/// Incremental digest over everything that determines a compile's output:
/// the semantically relevant command-line arguments, the source path with
/// the configured root stripped, the preprocessed source with line markers
/// elided, and finally the compiler environment hash. The builder uses the
/// finished hex digest as its object-cache key.
#[derive(Clone)]
pub struct Fingerprint {
    hasher: Sha1,
}

impl Fingerprint {
    pub fn new() -> Self {
        Fingerprint { hasher: Sha1::new() }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(data.as_ref());
    }

    /// Feeds preprocessed output, skipping `# <lineno>` directive lines so
    /// the digest is stable across header path remappings.
    pub fn update_preprocessed(&mut self, chunk: &[u8]) {
        let mut last = 0;
        let mut i = 0;
        while i < chunk.len() {
            if chunk[i] == b'#'
                && (i == 0 || chunk[i - 1] == b'\n')
                && chunk.get(i + 1) == Some(&b' ')
                && chunk.get(i + 2).is_some_and(u8::is_ascii_digit)
            {
                if i > last {
                    self.hasher.update(&chunk[last..i]);
                }
                while i < chunk.len() && chunk[i] != b'\n' {
                    i += 1;
                }
                last = i;
            } else {
                i += 1;
            }
        }
        if last < chunk.len() {
            self.hasher.update(&chunk[last..]);
        }
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Fingerprint::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of_preprocessed(input: &[u8]) -> String {
        let mut fp = Fingerprint::new();
        fp.update_preprocessed(input);
        fp.finish_hex()
    }

    #[test]
    fn line_markers_do_not_affect_digest() {
        let bare = b"int main() {\nreturn 0;\n}\n";
        let with_markers = b"# 1 \"/tmp/build/foo.c\"\nint main() {\n# 42 \"/usr/include/stdio.h\" 2\nreturn 0;\n}\n";
        assert_eq!(
            digest_of_preprocessed(bare),
            digest_of_preprocessed(with_markers)
        );
    }

    #[test]
    fn marker_at_chunk_start_is_elided() {
        let a = digest_of_preprocessed(b"# 10 \"x.h\"\ncode\n");
        let b = digest_of_preprocessed(b"\ncode\n");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_directives_are_kept() {
        // #include / #define survive -fdirectives-only and must count.
        let a = digest_of_preprocessed(b"#define X 1\n");
        let b = digest_of_preprocessed(b"\n");
        assert_ne!(a, b);
    }

    #[test]
    fn argument_order_matters() {
        let mut a = Fingerprint::new();
        a.update("-Ifoo");
        a.update("-Ibar");
        let mut b = Fingerprint::new();
        b.update("-Ibar");
        b.update("-Ifoo");
        assert_ne!(a.finish_hex(), b.finish_hex());
    }
}
