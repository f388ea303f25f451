//! Minimal FITS encoder and reader.
//!
//! Only what the stripe writer needs: fixed-format header cards, a data-less primary
//! HDU and 2-D `BITPIX = 32` image extensions.
//!
//! # Layout
//!
//! ```text
//! [primary header][ext 0 header][ext 0 data][ext 1 header][ext 1 data] ...
//! ```
//!
//! Every header and every data unit is padded to a multiple of [`BLOCK_LEN`] bytes:
//! headers with ASCII spaces, data with zeros. Image data is big-endian `i32`.

use crate::error::{AppResult, RebError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// FITS logical record length.
pub const BLOCK_LEN: usize = 2880;

/// Header card length.
pub const CARD_LEN: usize = 80;

const KEYWORD_LEN: usize = 8;
const VALUE_COLUMN: usize = 10;
/// Fixed-format numbers and logicals end in column 30
const FIXED_VALUE_END: usize = 30;

/// Value of a header keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// `T` / `F`
    Logical(bool),
    /// Integer
    Integer(i64),
    /// Quoted character string
    Text(String),
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Logical(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Integer(i64::from(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

/// One `KEYWORD = value / comment` card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    /// Keyword, at most 8 characters
    pub keyword: String,
    /// Value
    pub value: HeaderValue,
    /// Comment, may be empty
    pub comment: String,
}

impl Card {
    /// Render into exactly 80 ASCII bytes.
    pub fn encode(&self) -> AppResult<[u8; CARD_LEN]> {
        validate_keyword(&self.keyword)?;

        let mut text = format!("{:<width$}= ", self.keyword, width = KEYWORD_LEN);
        match &self.value {
            HeaderValue::Logical(v) => {
                let pad = FIXED_VALUE_END - VALUE_COLUMN;
                text.push_str(&format!("{:>pad$}", if *v { "T" } else { "F" }));
            }
            HeaderValue::Integer(v) => {
                let pad = FIXED_VALUE_END - VALUE_COLUMN;
                text.push_str(&format!("{:>pad$}", v));
            }
            HeaderValue::Text(v) => {
                if !v.is_ascii() {
                    return Err(RebError::Persistence {
                        path: self.keyword.clone(),
                        message: "header strings must be ASCII".to_string(),
                    });
                }
                // Short strings are padded to 8 characters inside the quotes
                text.push_str(&format!("'{:<8}'", v.replace('\'', "''")));
            }
        }

        if text.len() > CARD_LEN {
            return Err(RebError::Persistence {
                path: self.keyword.clone(),
                message: format!("card value does not fit in {} columns", CARD_LEN),
            });
        }

        // Only the comment is ever cut short
        if !self.comment.is_empty() {
            text.push_str(" / ");
            text.push_str(&self.comment);
            text.truncate(CARD_LEN);
        }

        let mut card = [b' '; CARD_LEN];
        card[..text.len()].copy_from_slice(text.as_bytes());
        Ok(card)
    }

    /// Parse one 80-byte card. Returns `None` for `END`, blank and commentary cards.
    pub fn decode(raw: &[u8]) -> AppResult<Option<Self>> {
        if raw.len() != CARD_LEN || !raw.is_ascii() {
            return Err(RebError::Protocol("Malformed FITS card".to_string()));
        }
        let text = std::str::from_utf8(raw)
            .map_err(|e| RebError::Protocol(format!("Malformed FITS card: {}", e)))?;
        if &text[KEYWORD_LEN..VALUE_COLUMN] != "= " {
            return Ok(None);
        }

        let keyword = text[..KEYWORD_LEN].trim_end().to_string();
        let field = &text[VALUE_COLUMN..];
        let trimmed = field.trim_start();

        let (value, rest) = if let Some(quoted) = trimmed.strip_prefix('\'') {
            let mut value = String::new();
            let mut chars = quoted.char_indices().peekable();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        value.push('\'');
                        chars.next();
                        continue;
                    }
                    end = i + 1;
                    break;
                }
                value.push(c);
            }
            (
                HeaderValue::Text(value.trim_end().to_string()),
                &quoted[end..],
            )
        } else {
            let (token, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
            let token = token.trim();
            let value = match token {
                "T" => HeaderValue::Logical(true),
                "F" => HeaderValue::Logical(false),
                _ => token.parse::<i64>().map(HeaderValue::Integer).map_err(|_| {
                    RebError::Protocol(format!("Unsupported value for {}: {}", keyword, token))
                })?,
            };
            (value, rest)
        };

        let comment = rest
            .trim_start()
            .strip_prefix('/')
            .unwrap_or(rest)
            .trim()
            .to_string();

        Ok(Some(Self {
            keyword,
            value,
            comment,
        }))
    }
}

fn validate_keyword(keyword: &str) -> AppResult<()> {
    let valid = !keyword.is_empty()
        && keyword.len() <= KEYWORD_LEN
        && keyword
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(RebError::Persistence {
            path: keyword.to_string(),
            message: "invalid FITS keyword".to_string(),
        })
    }
}

/// Ordered list of cards. Setting an existing keyword replaces it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    cards: Vec<Card>,
}

impl Header {
    /// Empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `keyword`, keeping its position when it already exists.
    pub fn set(
        &mut self,
        keyword: &str,
        value: impl Into<HeaderValue>,
        comment: &str,
    ) -> &mut Self {
        let card = Card {
            keyword: keyword.to_string(),
            value: value.into(),
            comment: comment.to_string(),
        };
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
        self
    }

    /// Value of `keyword`.
    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .map(|c| &c.value)
    }

    /// Integer value of `keyword`.
    pub fn integer(&self, keyword: &str) -> Option<i64> {
        match self.get(keyword)? {
            HeaderValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// String value of `keyword`.
    pub fn text(&self, keyword: &str) -> Option<&str> {
        match self.get(keyword)? {
            HeaderValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Cards in order.
    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// Append the cards of `extra`, refusing any keyword this header already has.
    pub fn extend_new(&mut self, extra: &Header) -> AppResult<()> {
        for card in extra.cards() {
            if self.get(&card.keyword).is_some() {
                return Err(RebError::Persistence {
                    path: card.keyword.clone(),
                    message: "keyword is already set and cannot be overridden".to_string(),
                });
            }
            self.cards.push(card.clone());
        }
        Ok(())
    }

    fn write_to(&self, buf: &mut BytesMut) -> AppResult<()> {
        let start = buf.len();
        for card in &self.cards {
            buf.put_slice(&card.encode()?);
        }
        let mut end = [b' '; CARD_LEN];
        end[..3].copy_from_slice(b"END");
        buf.put_slice(&end);
        pad_block(buf, start, b' ');
        Ok(())
    }
}

fn pad_block(buf: &mut BytesMut, start: usize, fill: u8) {
    let used = (buf.len() - start) % BLOCK_LEN;
    if used != 0 {
        buf.put_bytes(fill, BLOCK_LEN - used);
    }
}

/// One header/data unit read back from a file.
#[derive(Debug, Clone)]
pub struct Hdu {
    /// Parsed header cards
    pub header: Header,
    /// Image pixels in row-major order; empty for the primary HDU
    pub data: Vec<i32>,
}

/// Incremental writer for a single FITS file held in memory.
#[derive(Debug)]
pub struct FitsEncoder {
    buf: BytesMut,
    extensions: usize,
}

impl FitsEncoder {
    /// Start a file with a data-less primary HDU.
    ///
    /// The mandatory keywords come first; `extra` cards follow in order.
    pub fn new(extra: &Header) -> AppResult<Self> {
        let mut header = Header::new();
        header
            .set("SIMPLE", true, "conforms to FITS standard")
            .set("BITPIX", 32i64, "array data type")
            .set("NAXIS", 0i64, "number of array dimensions")
            .set("EXTEND", true, "");
        header.extend_new(extra)?;

        let mut buf = BytesMut::with_capacity(BLOCK_LEN * 2);
        header.write_to(&mut buf)?;
        Ok(Self { buf, extensions: 0 })
    }

    /// Append a `width x height` image extension.
    ///
    /// `pixels` must hold exactly `width * height` values in row-major order. They are
    /// stored as big-endian two's complement, bit for bit.
    pub fn add_image(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u32],
        extra: &Header,
    ) -> AppResult<()> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(RebError::Persistence {
                path: format!("extension {}", self.extensions),
                message: format!(
                    "image data size mismatch: expected {} pixels for {}x{}, got {}",
                    expected,
                    width,
                    height,
                    pixels.len()
                ),
            });
        }

        let mut header = Header::new();
        header
            .set("XTENSION", "IMAGE", "image extension")
            .set("BITPIX", 32i64, "array data type")
            .set("NAXIS", 2i64, "number of array dimensions")
            .set("NAXIS1", width, "")
            .set("NAXIS2", height, "")
            .set("PCOUNT", 0i64, "number of parameters")
            .set("GCOUNT", 1i64, "number of groups");
        header.extend_new(extra)?;
        header.write_to(&mut self.buf)?;

        let start = self.buf.len();
        self.buf.reserve(expected * 4 + BLOCK_LEN);
        for pixel in pixels {
            self.buf.put_u32(*pixel);
        }
        pad_block(&mut self.buf, start, 0);

        self.extensions += 1;
        Ok(())
    }

    /// Image extensions written so far.
    pub fn extensions(&self) -> usize {
        self.extensions
    }

    /// Finished file contents.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Parse a whole file into its HDUs.
pub fn read_hdus(mut bytes: &[u8]) -> AppResult<Vec<Hdu>> {
    let mut hdus = Vec::new();

    while !bytes.is_empty() {
        let mut header = Header::new();
        let mut ended = false;
        let mut consumed = 0;

        while !ended {
            if bytes.len() < consumed + BLOCK_LEN {
                return Err(RebError::Protocol("Truncated FITS header".to_string()));
            }
            for raw in bytes[consumed..consumed + BLOCK_LEN].chunks(CARD_LEN) {
                if raw.starts_with(b"END ") {
                    ended = true;
                    break;
                }
                if let Some(card) = Card::decode(raw)? {
                    header.cards.push(card);
                }
            }
            consumed += BLOCK_LEN;
        }
        bytes.advance(consumed);

        let naxis = header.integer("NAXIS").unwrap_or(0);
        let pixels = if naxis == 0 {
            0
        } else {
            (1..=naxis)
                .map(|i| header.integer(&format!("NAXIS{}", i)).unwrap_or(0))
                .product::<i64>()
        };
        let pixels = usize::try_from(pixels)
            .map_err(|_| RebError::Protocol("Negative FITS axis length".to_string()))?;

        let data_len = pixels * 4;
        let padded = data_len.div_ceil(BLOCK_LEN) * BLOCK_LEN;
        if bytes.len() < padded {
            return Err(RebError::Protocol("Truncated FITS data unit".to_string()));
        }
        let mut data_bytes = &bytes[..data_len];
        let mut data = Vec::with_capacity(pixels);
        while data_bytes.has_remaining() {
            data.push(data_bytes.get_i32());
        }
        bytes.advance(padded);

        hdus.push(Hdu { header, data });
    }

    Ok(hdus)
}
