/// Append-only bounded text buffer for captured process output.
///
/// When the cap is exceeded the oldest content is trimmed first; the
/// newest output always survives. Trimming lands on a UTF-8 character
/// boundary so a snapshot is always valid text.
#[derive(Debug)]
pub struct OutputBuffer {
    data: String,
    cap: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
        }
    }

    /// Append a chunk, trimming the front if the cap is exceeded.
    pub fn append(&mut self, chunk: &str) {
        self.data.push_str(chunk);
        if self.data.len() > self.cap {
            let mut cut = self.data.len() - self.cap;
            while cut < self.data.len() && !self.data.is_char_boundary(cut) {
                cut += 1;
            }
            self.data.drain(..cut);
        }
    }

    /// Point-in-time copy of the buffered content.
    pub fn snapshot(&self) -> String {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
