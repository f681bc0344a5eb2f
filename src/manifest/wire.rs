//! Just enough of the Cap'n Proto binary encoding to read and write package
//! manifests.
//!
//! A message is a segment table followed by segments of little-endian 64-bit
//! words.  Every pointer read is bounds checked against its segment, object
//! nesting is limited, and the total number of words visited is capped so a
//! hostile message with overlapping pointers cannot amplify work.

use crate::error::ManifestError;

fn malformed(msg: impl Into<String>) -> ManifestError {
    ManifestError::malformed(msg)
}

const WORD: usize = 8;

/// Segment count is bounded well below what the header allows.
const MAX_SEGMENTS: usize = 512;

/// Default nesting limit for structs and lists.
pub const DEFAULT_NESTING_LIMIT: u32 = 64;

/// Default number of words that may be visited while reading one message.
pub const DEFAULT_TRAVERSAL_LIMIT: u64 = 8 * 1024 * 1024;

const KIND_STRUCT: u64 = 0;
const KIND_LIST: u64 = 1;
const KIND_FAR: u64 = 2;

const ELEM_BYTE: u64 = 2;
const ELEM_POINTER: u64 = 6;
const ELEM_COMPOSITE: u64 = 7;

/// A framed message borrowed from a byte buffer.
pub struct Message<'a> {
    segments: Vec<&'a [u8]>,
    budget: std::cell::Cell<u64>,
    nesting_limit: u32,
}

impl<'a> Message<'a> {
    /// Split the stream framing into segments.  Bytes after the last segment
    /// are ignored.
    pub fn from_bytes(buf: &'a [u8]) -> Result<Message<'a>, ManifestError> {
        let count = read_u32(buf, 0)
            .ok_or_else(|| malformed("message shorter than its segment table"))?
            as usize
            + 1;
        if count > MAX_SEGMENTS {
            return Err(malformed(format!("too many segments: {count}")));
        }
        // The count, then one size per segment, padded to a whole word.
        let table_len = (4 * (count + 1)).next_multiple_of(WORD);
        if buf.len() < table_len {
            return Err(malformed("message shorter than its segment table"));
        }
        let mut segments = Vec::with_capacity(count);
        let mut offset = table_len;
        for i in 0..count {
            let words = read_u32(buf, 4 * (i + 1)).unwrap_or(0) as usize;
            let end = words
                .checked_mul(WORD)
                .and_then(|len| offset.checked_add(len))
                .filter(|end| *end <= buf.len())
                .ok_or_else(|| malformed(format!("segment {i} runs past end of message")))?;
            segments.push(&buf[offset..end]);
            offset = end;
        }
        Ok(Message {
            segments,
            budget: std::cell::Cell::new(DEFAULT_TRAVERSAL_LIMIT),
            nesting_limit: DEFAULT_NESTING_LIMIT,
        })
    }

    pub fn with_limits(mut self, traversal_words: u64, nesting: u32) -> Self {
        self.budget.set(traversal_words);
        self.nesting_limit = nesting;
        self
    }

    /// The root struct, or `None` if the root pointer is null.
    pub fn root(&self) -> Result<Option<StructReader<'_, 'a>>, ManifestError> {
        if self.segments.first().is_none_or(|s| s.is_empty()) {
            return Err(malformed("message has no root pointer"));
        }
        self.read_struct(Loc { segment: 0, word: 0 }, self.nesting_limit)
    }

    fn word(&self, loc: Loc) -> Result<u64, ManifestError> {
        let seg = self
            .segments
            .get(loc.segment)
            .ok_or_else(|| malformed(format!("no segment {}", loc.segment)))?;
        let start = loc
            .word
            .checked_mul(WORD)
            .filter(|s| s + WORD <= seg.len())
            .ok_or_else(|| malformed("pointer outside its segment"))?;
        let mut b = [0u8; WORD];
        b.copy_from_slice(&seg[start..start + WORD]);
        Ok(u64::from_le_bytes(b))
    }

    /// Check that `words` words starting at `start` lie inside the segment.
    fn check_range(&self, segment: usize, start: usize, words: u64) -> Result<(), ManifestError> {
        let seg_words = self.segments.get(segment).map_or(0, |s| s.len() / WORD) as u64;
        if (start as u64).saturating_add(words) > seg_words {
            return Err(malformed("object runs past end of segment"));
        }
        Ok(())
    }

    fn charge(&self, words: u64) -> Result<(), ManifestError> {
        // Zero-sized objects still cost a word so repeated pointers to them
        // are bounded too.
        let words = words.max(1);
        let left = self.budget.get();
        if words > left {
            return Err(malformed("message exceeds traversal limit"));
        }
        self.budget.set(left - words);
        Ok(())
    }

    /// Follow the pointer at `loc` to its tag and target, resolving far
    /// pointers.  `None` for a null pointer.
    fn follow(&self, loc: Loc) -> Result<Option<(u64, Loc)>, ManifestError> {
        let ptr = self.word(loc)?;
        if ptr == 0 {
            return Ok(None);
        }
        if ptr & 3 != KIND_FAR {
            return Ok(Some((ptr, near_target(loc, ptr)?)));
        }
        let double = (ptr >> 2) & 1 == 1;
        let pad = Loc {
            segment: (ptr >> 32) as usize,
            word: ((ptr >> 3) & 0x1fff_ffff) as usize,
        };
        let landing = self.word(pad)?;
        if !double {
            if landing & 3 == KIND_FAR {
                return Err(malformed("far pointer lands on another far pointer"));
            }
            return Ok(Some((landing, near_target(pad, landing)?)));
        }
        // Double far: the pad is a far pointer to the content, then its tag.
        if landing & 7 != KIND_FAR {
            return Err(malformed("double-far landing pad is not a single far pointer"));
        }
        let tag = self.word(Loc {
            segment: pad.segment,
            word: pad.word + 1,
        })?;
        if tag & 3 == KIND_FAR {
            return Err(malformed("double-far tag is a far pointer"));
        }
        let content = Loc {
            segment: (landing >> 32) as usize,
            word: ((landing >> 3) & 0x1fff_ffff) as usize,
        };
        if content.segment >= self.segments.len() {
            return Err(malformed(format!("no segment {}", content.segment)));
        }
        Ok(Some((tag, content)))
    }

    fn read_struct(&self, loc: Loc, depth: u32) -> Result<Option<StructReader<'_, 'a>>, ManifestError> {
        let Some((tag, target)) = self.follow(loc)? else {
            return Ok(None);
        };
        if tag & 3 != KIND_STRUCT {
            return Err(malformed("expected a struct pointer"));
        }
        if depth == 0 {
            return Err(malformed("message nests too deeply"));
        }
        let data_words = ((tag >> 32) & 0xffff) as u16;
        let ptr_count = (tag >> 48) as u16;
        let size = data_words as u64 + ptr_count as u64;
        self.check_range(target.segment, target.word, size)?;
        self.charge(size)?;
        Ok(Some(StructReader {
            msg: self,
            at: target,
            data_words,
            ptr_count,
            depth: depth - 1,
        }))
    }

    fn read_list(&self, loc: Loc, depth: u32) -> Result<Option<ListReader<'_, 'a>>, ManifestError> {
        let Some((tag, target)) = self.follow(loc)? else {
            return Ok(None);
        };
        if tag & 3 != KIND_LIST {
            return Err(malformed("expected a list pointer"));
        }
        if depth == 0 {
            return Err(malformed("message nests too deeply"));
        }
        let elem = (tag >> 32) & 7;
        let count = tag >> 35;
        let layout = match elem {
            ELEM_COMPOSITE => {
                // `count` is the word count of the elements, after a tag word.
                self.check_range(target.segment, target.word, count + 1)?;
                let elem_tag = self.word(target)?;
                if elem_tag & 3 != KIND_STRUCT {
                    return Err(malformed("composite list tag is not a struct"));
                }
                let elements = (elem_tag >> 2) & 0x3fff_ffff;
                let data_words = ((elem_tag >> 32) & 0xffff) as u16;
                let ptr_count = (elem_tag >> 48) as u16;
                let stride = data_words as u64 + ptr_count as u64;
                if elements.saturating_mul(stride) > count {
                    return Err(malformed("composite list elements exceed its size"));
                }
                self.charge(count.max(elements))?;
                ListLayout {
                    start: target.word + 1,
                    len: elements as usize,
                    elem: ListElem::Struct {
                        data_words,
                        ptr_count,
                    },
                }
            }
            ELEM_POINTER => {
                self.check_range(target.segment, target.word, count)?;
                self.charge(count)?;
                ListLayout {
                    start: target.word,
                    len: count as usize,
                    elem: ListElem::Pointer,
                }
            }
            ELEM_BYTE => {
                self.check_range(target.segment, target.word, count.div_ceil(WORD as u64))?;
                self.charge(count.div_ceil(WORD as u64))?;
                ListLayout {
                    start: target.word,
                    len: count as usize,
                    elem: ListElem::Byte,
                }
            }
            other => {
                return Err(malformed(format!("unsupported list element size {other}")));
            }
        };
        Ok(Some(ListReader {
            msg: self,
            segment: target.segment,
            layout,
            depth: depth - 1,
        }))
    }

    fn read_text(&self, loc: Loc, depth: u32) -> Result<Option<String>, ManifestError> {
        let Some(list) = self.read_list(loc, depth)? else {
            return Ok(None);
        };
        let bytes = list.bytes()?;
        let Some((&last, text)) = bytes.split_last() else {
            return Ok(Some(String::new()));
        };
        if last != 0 {
            return Err(malformed("text is not NUL terminated"));
        }
        String::from_utf8(text.to_vec())
            .map(Some)
            .map_err(|_| malformed("text is not valid UTF-8"))
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Target of a struct or list pointer: the word after the pointer plus its
/// signed offset.
fn near_target(loc: Loc, ptr: u64) -> Result<Loc, ManifestError> {
    let offset = (ptr as u32 as i32 >> 2) as i64;
    let word = loc.word as i64 + 1 + offset;
    if word < 0 {
        return Err(malformed("pointer offset before start of segment"));
    }
    Ok(Loc {
        segment: loc.segment,
        word: word as usize,
    })
}

#[derive(Clone, Copy, Debug)]
struct Loc {
    segment: usize,
    word: usize,
}

pub struct StructReader<'m, 'a> {
    msg: &'m Message<'a>,
    at: Loc,
    data_words: u16,
    ptr_count: u16,
    depth: u32,
}

impl<'m, 'a> StructReader<'m, 'a> {
    /// Pointer field `index`, or `None` if the struct predates that field.
    fn pointer(&self, index: u16) -> Option<Loc> {
        (index < self.ptr_count).then(|| Loc {
            segment: self.at.segment,
            word: self.at.word + self.data_words as usize + index as usize,
        })
    }

    pub fn struct_field(&self, index: u16) -> Result<Option<StructReader<'m, 'a>>, ManifestError> {
        match self.pointer(index) {
            Some(loc) => self.msg.read_struct(loc, self.depth),
            None => Ok(None),
        }
    }

    pub fn list_field(&self, index: u16) -> Result<Option<ListReader<'m, 'a>>, ManifestError> {
        match self.pointer(index) {
            Some(loc) => self.msg.read_list(loc, self.depth),
            None => Ok(None),
        }
    }

    pub fn text_field(&self, index: u16) -> Result<Option<String>, ManifestError> {
        match self.pointer(index) {
            Some(loc) => self.msg.read_text(loc, self.depth),
            None => Ok(None),
        }
    }
}

struct ListLayout {
    start: usize,
    len: usize,
    elem: ListElem,
}

enum ListElem {
    Byte,
    Pointer,
    Struct { data_words: u16, ptr_count: u16 },
}

pub struct ListReader<'m, 'a> {
    msg: &'m Message<'a>,
    segment: usize,
    layout: ListLayout,
    depth: u32,
}

impl<'m, 'a> ListReader<'m, 'a> {
    pub fn len(&self) -> usize {
        self.layout.len
    }

    pub fn is_empty(&self) -> bool {
        self.layout.len == 0
    }

    fn bytes(&self) -> Result<&'a [u8], ManifestError> {
        let ListElem::Byte = self.layout.elem else {
            return Err(malformed("expected a list of bytes"));
        };
        let seg = self
            .msg
            .segments
            .get(self.segment)
            .copied()
            .ok_or_else(|| malformed(format!("no segment {}", self.segment)))?;
        let start = self.layout.start * WORD;
        start
            .checked_add(self.layout.len)
            .and_then(|end| seg.get(start..end))
            .ok_or_else(|| malformed("text runs past end of segment"))
    }

    /// Read a `List(Text)`.
    pub fn texts(&self) -> Result<Vec<String>, ManifestError> {
        let ListElem::Pointer = self.layout.elem else {
            return Err(malformed("expected a list of text"));
        };
        (0..self.layout.len)
            .map(|i| {
                let loc = Loc {
                    segment: self.segment,
                    word: self.layout.start + i,
                };
                // A null element reads as empty text.
                Ok(self.msg.read_text(loc, self.depth)?.unwrap_or_default())
            })
            .collect()
    }

    /// Element `index` of a list of structs.
    pub fn struct_at(&self, index: usize) -> Result<StructReader<'m, 'a>, ManifestError> {
        let ListElem::Struct {
            data_words,
            ptr_count,
        } = self.layout.elem
        else {
            return Err(malformed("expected a list of structs"));
        };
        if index >= self.layout.len {
            return Err(malformed("list index out of range"));
        }
        let stride = data_words as usize + ptr_count as usize;
        Ok(StructReader {
            msg: self.msg,
            at: Loc {
                segment: self.segment,
                word: self.layout.start + index * stride,
            },
            data_words,
            ptr_count,
            depth: self.depth,
        })
    }
}

/// Builds a single-segment message.
pub struct Builder {
    words: Vec<u64>,
}

impl Builder {
    /// Start a message whose root struct has the given section sizes.  The
    /// root struct is at word 1.
    pub fn new(data_words: u16, ptr_count: u16) -> Self {
        let mut b = Builder { words: vec![0] };
        let root = b.alloc(data_words as usize + ptr_count as usize);
        b.set_struct(0, root, data_words, ptr_count);
        b
    }

    /// Word index of pointer field `index` of the struct at `at`.
    pub fn field(at: usize, data_words: u16, index: u16) -> usize {
        at + data_words as usize + index as usize
    }

    fn alloc(&mut self, words: usize) -> usize {
        let at = self.words.len();
        self.words.resize(at + words, 0);
        at
    }

    fn offset(ptr: usize, target: usize) -> u64 {
        let off = target as i64 - ptr as i64 - 1;
        ((off as i32 as u32) << 2) as u64
    }

    fn set_struct(&mut self, ptr: usize, target: usize, data_words: u16, ptr_count: u16) {
        self.words[ptr] = KIND_STRUCT
            | Self::offset(ptr, target)
            | (data_words as u64) << 32
            | (ptr_count as u64) << 48;
    }

    fn set_list(&mut self, ptr: usize, target: usize, elem: u64, count: u64) {
        self.words[ptr] = KIND_LIST | Self::offset(ptr, target) | elem << 32 | count << 35;
    }

    /// Allocate a struct and point `ptr` at it.  Returns its word index.
    pub fn init_struct(&mut self, ptr: usize, data_words: u16, ptr_count: u16) -> usize {
        let at = self.alloc(data_words as usize + ptr_count as usize);
        self.set_struct(ptr, at, data_words, ptr_count);
        at
    }

    pub fn set_text(&mut self, ptr: usize, text: &str) {
        let len = text.len() + 1;
        let at = self.alloc(len.div_ceil(WORD));
        for (i, chunk) in text.as_bytes().chunks(WORD).enumerate() {
            let mut b = [0u8; WORD];
            b[..chunk.len()].copy_from_slice(chunk);
            self.words[at + i] = u64::from_le_bytes(b);
        }
        self.set_list(ptr, at, ELEM_BYTE, len as u64);
    }

    pub fn set_text_list(&mut self, ptr: usize, texts: &[String]) {
        let at = self.alloc(texts.len());
        self.set_list(ptr, at, ELEM_POINTER, texts.len() as u64);
        for (i, t) in texts.iter().enumerate() {
            self.set_text(at + i, t);
        }
    }

    /// Allocate a composite list.  Returns the word index of each element.
    pub fn init_struct_list(
        &mut self,
        ptr: usize,
        len: usize,
        data_words: u16,
        ptr_count: u16,
    ) -> Vec<usize> {
        let stride = data_words as usize + ptr_count as usize;
        let tag = self.alloc(1 + len * stride);
        self.words[tag] = KIND_STRUCT
            | ((len as u64) << 2)
            | (data_words as u64) << 32
            | (ptr_count as u64) << 48;
        self.set_list(ptr, tag, ELEM_COMPOSITE, (len * stride) as u64);
        (0..len).map(|i| tag + 1 + i * stride).collect()
    }

    /// Serialize with the stream framing.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WORD * (self.words.len() + 1));
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for w in self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }
}
