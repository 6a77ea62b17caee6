//! Percent-decoding for query strings and `application/x-www-form-urlencoded` bodies.

/// Decodes a url-encoded string.
///
/// - `+` decodes to a space
/// - `%XX` decodes to the byte `0xXX`, consecutive bytes are interpreted as UTF-8
/// - `%uXXXX` decodes to the unicode scalar `U+XXXX`
/// - an incomplete or non-hex escape is kept literally
///
/// Invalid UTF-8 byte sequences are replaced with `U+FFFD`.
pub fn url_decode(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let mut decoder = Utf8Collector::with_capacity(s.len());

    let mut i = 0;
    while i < len {
        let ch = chars[i];

        if ch == '+' {
            decoder.push_byte(b' ');
            i += 1;
            continue;
        }

        if ch == '%' && i + 2 < len {
            if chars[i + 1] == 'u' {
                if i + 5 < len
                    && let Some(code) = hex4(&chars[i + 2..i + 6])
                {
                    decoder.push_char(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                    i += 6;
                    continue;
                }
            } else if let (Some(high), Some(low)) = (hex(chars[i + 1]), hex(chars[i + 2])) {
                decoder.push_byte((high << 4) | low);
                i += 3;
                continue;
            }
        }

        if ch.is_ascii() {
            decoder.push_byte(ch as u8);
        } else {
            decoder.push_char(ch);
        }
        i += 1;
    }

    decoder.finish()
}

fn hex(c: char) -> Option<u8> {
    c.to_digit(16).and_then(|d| u8::try_from(d).ok())
}

fn hex4(chars: &[char]) -> Option<u32> {
    chars.iter().try_fold(0u32, |acc, c| c.to_digit(16).map(|d| (acc << 4) | d))
}

/// Accumulates raw bytes and already decoded chars, flushing pending bytes
/// as UTF-8 whenever a char is pushed.
struct Utf8Collector {
    bytes: Vec<u8>,
    out: String,
}

impl Utf8Collector {
    fn with_capacity(capacity: usize) -> Self {
        Self { bytes: Vec::new(), out: String::with_capacity(capacity) }
    }

    fn push_byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn push_char(&mut self, c: char) {
        self.flush();
        self.out.push(c);
    }

    fn flush(&mut self) {
        if !self.bytes.is_empty() {
            self.out.push_str(&String::from_utf8_lossy(&self.bytes));
            self.bytes.clear();
        }
    }

    fn finish(mut self) -> String {
        self.flush();
        self.out
    }
}
