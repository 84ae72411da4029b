//! Binary codec for bridge messages.
//!
//! Frames are self-delimiting: an 8-byte `[kind, aux]` header followed by a payload
//! whose length follows from the header (and, for lists and dicts, from nested
//! messages up to an `EOL(0)`). There is no outer length prefix, so the decoder parses
//! the buffered bytes from the start of the frame and only consumes them once the
//! whole message is present.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Action, Args, EolFlag, Message, Name, kind};
use super::types::{ElementType, NumericArray, RangeSpec, RangeStyle, StringArray, element_count};
use crate::error::BridgeError;
use crate::refs::Handle;

pub const DEFAULT_MAX_DEPTH: usize = 64;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Codec for [`Message`] frames over any byte stream.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_depth: usize,
    max_frame_bytes: usize,
    /// Buffered length below which the current frame cannot be complete.
    need: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            need: HEADER_LEN,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }
}

enum Parse {
    /// More bytes are needed; the frame is at least this long.
    Incomplete(usize),
    Fail(BridgeError),
}

impl From<BridgeError> for Parse {
    fn from(err: BridgeError) -> Self {
        Parse::Fail(err)
    }
}

type ParseResult<T> = Result<T, Parse>;

fn malformed<T>(message: impl Into<String>) -> ParseResult<T> {
    Err(Parse::Fail(BridgeError::malformed(message)))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    max_depth: usize,
    max_frame_bytes: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| BridgeError::malformed("frame length overflows"))?;
        if end > self.max_frame_bytes {
            return malformed(format!(
                "frame exceeds {} bytes",
                self.max_frame_bytes
            ));
        }
        if end > self.buf.len() {
            return Err(Parse::Incomplete(end));
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn i32(&mut self) -> ParseResult<i32> {
        Ok(self.take(4)?.get_i32_le())
    }

    fn header(&mut self) -> ParseResult<(i32, i32)> {
        let mut bytes = self.take(HEADER_LEN)?;
        Ok((bytes.get_i32_le(), bytes.get_i32_le()))
    }

    fn length(&self, declared: i32, what: &str) -> ParseResult<usize> {
        if declared < 0 {
            return malformed(format!("negative {what} length {declared}"));
        }
        Ok(declared as usize)
    }

    fn text(&mut self, len: usize) -> ParseResult<String> {
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_string()),
            Err(_) => malformed("text is not UTF-8"),
        }
    }

    fn extents(&mut self, rank: i32) -> ParseResult<Vec<usize>> {
        if rank < 0 {
            return malformed(format!("negative rank {rank}"));
        }
        let mut dims = Vec::with_capacity((rank as usize).min(16));
        for axis in 0..rank {
            let extent = self.i32()?;
            if extent <= 0 {
                return malformed(format!("extent {extent} on axis {axis}"));
            }
            dims.push(extent as usize);
        }
        Ok(dims)
    }

    fn element_count(&self, dims: &[usize]) -> ParseResult<usize> {
        element_count(dims).ok_or_else(|| Parse::Fail(BridgeError::malformed("element count overflows")))
    }

    fn name(&mut self, tag: i32) -> ParseResult<Name> {
        match tag {
            0 => {
                let declared = self.i32()?;
                let len = self.length(declared, "name")?;
                Ok(Name::Literal(self.text(len)?))
            }
            1 => {
                let raw = self.i32()?;
                match Handle::from_wire(raw) {
                    Ok(handle) => Ok(Name::Reference(handle)),
                    Err(_) => malformed(format!("reference name with handle {raw}")),
                }
            }
            other => malformed(format!("unknown name tag {other}")),
        }
    }

    fn message(&mut self, depth: usize) -> ParseResult<Message> {
        if depth > self.max_depth {
            return malformed(format!("nesting deeper than {}", self.max_depth));
        }
        let (code, aux) = self.header()?;
        match code {
            kind::EOL => match EolFlag::from_wire(aux) {
                Some(flag) => Ok(Message::Eol(flag)),
                None => malformed(format!("unknown EOL flag {aux}")),
            },
            kind::STRINGS => self.strings(aux),
            kind::NIL => Ok(Message::Nil),
            kind::RANGE => {
                let Some(style) = RangeStyle::from_flag(aux) else {
                    return malformed(format!("unknown range style {aux}"));
                };
                let mut bytes = self.take(24)?;
                Ok(Message::Range(RangeSpec::decode_body(style, &mut bytes)))
            }
            kind::LIST => Ok(Message::List(self.list_body(depth)?)),
            kind::DICT => self.dict_body(depth),
            kind::REFERENCE => match Handle::from_wire(aux) {
                Ok(handle) => Ok(Message::Reference(handle)),
                Err(_) => malformed(format!("reference with handle {aux}")),
            },
            kind::EVALUATE | kind::EXECUTE => {
                let len = self.length(aux, "text")?;
                let text = self.text(len)?;
                Ok(Message::Action(if code == kind::EVALUATE {
                    Action::Evaluate(text)
                } else {
                    Action::Execute(text)
                }))
            }
            kind::GET_VAR => Ok(Action::GetVar(self.name(aux)?).into()),
            kind::SET_VAR => {
                let name = self.name(aux)?;
                let value = Box::new(self.message(depth + 1)?);
                Ok(Action::SetVar { name, value }.into())
            }
            kind::CALL => {
                let name = self.name(aux)?;
                let expect_result = self.i32()? != 0;
                let args = self.args(depth)?;
                Ok(Action::Call {
                    name,
                    args,
                    expect_result,
                }
                .into())
            }
            kind::SUBROUTINE_CALL => {
                let name = self.name(aux)?;
                let args = self.args(depth)?;
                Ok(Action::SubroutineCall { name, args }.into())
            }
            kind::GET_SLICE => {
                let name = self.name(aux)?;
                let index = self.args(depth)?;
                Ok(Action::GetSlice { name, index }.into())
            }
            kind::SET_SLICE => {
                let name = self.name(aux)?;
                let index = self.args(depth)?;
                let value = Box::new(self.message(depth + 1)?);
                Ok(Action::SetSlice { name, index, value }.into())
            }
            kind::GET_SHAPE => Ok(Action::GetShape(self.name(aux)?).into()),
            kind::RELEASE => match Handle::from_wire(aux) {
                Ok(handle) => Ok(Action::Release(handle).into()),
                Err(_) => malformed(format!("release of handle {aux}")),
            },
            other => match ElementType::from_code(other) {
                Some(elem) => self.array(elem, aux),
                None => malformed(format!("unknown message kind {other}")),
            },
        }
    }

    fn array(&mut self, elem: ElementType, rank: i32) -> ParseResult<Message> {
        elem.ensure_supported()?;
        let dims = self.extents(rank)?;
        let count = self.element_count(&dims)?;
        let len = count
            .checked_mul(elem.width())
            .ok_or_else(|| BridgeError::malformed("array byte length overflows"))?;
        let mut body = self.take(len)?;
        Ok(Message::Array(NumericArray::decode_body(elem, dims, &mut body)?))
    }

    fn strings(&mut self, rank: i32) -> ParseResult<Message> {
        let dims = self.extents(rank)?;
        let count = self.element_count(&dims)?;
        let start = self.pos;
        let table_len = count
            .checked_mul(4)
            .ok_or_else(|| BridgeError::malformed("length table overflows"))?;
        let mut table = self.take(table_len)?;
        let mut total = 0usize;
        for _ in 0..count {
            let declared = table.get_i32_le();
            if declared < 0 {
                return malformed(format!("negative string length {declared}"));
            }
            total = total.saturating_add((declared as usize).saturating_sub(1));
        }
        self.take(total)?;
        let mut body = &self.buf[start..self.pos];
        Ok(Message::Strings(StringArray::decode_body(dims, &mut body)?))
    }

    /// Nested messages up to the terminating `EOL(0)`.
    fn list_body(&mut self, depth: usize) -> ParseResult<Vec<Message>> {
        let mut items = Vec::new();
        loop {
            match self.message(depth + 1)? {
                Message::Eol(EolFlag::Ok) => return Ok(items),
                Message::Eol(flag) => {
                    return malformed(format!("list terminated by EOL({})", flag.to_wire()));
                }
                item => items.push(item),
            }
        }
    }

    fn dict_body(&mut self, depth: usize) -> ParseResult<Message> {
        let mut entries = Vec::new();
        for item in self.list_body(depth)? {
            match item {
                Message::Action(Action::SetVar {
                    name: Name::Literal(key),
                    value,
                }) => entries.push((key, *value)),
                other => {
                    return malformed(format!("dict entry is a {} message", other.label()));
                }
            }
        }
        Ok(Message::Dict(entries))
    }

    fn args(&mut self, depth: usize) -> ParseResult<Args> {
        let (code, _) = self.header()?;
        if code != kind::LIST {
            return malformed(format!("argument list has kind {code}"));
        }
        Ok(Args::from_items(self.list_body(depth)?))
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.need.max(HEADER_LEN) {
            return Ok(None);
        }

        let mut cursor = Cursor {
            buf: &src[..],
            pos: 0,
            max_depth: self.max_depth,
            max_frame_bytes: self.max_frame_bytes,
        };
        match cursor.message(0) {
            Ok(message) => {
                let used = cursor.pos;
                src.advance(used);
                self.need = HEADER_LEN;
                tracing::trace!(frame_bytes = used, kind = message.label(), "Decoded frame");
                Ok(Some(message))
            }
            Err(Parse::Incomplete(need)) => {
                self.need = need;
                src.reserve(need.saturating_sub(src.len()).min(64 * 1024));
                Ok(None)
            }
            Err(Parse::Fail(err)) => {
                self.need = HEADER_LEN;
                Err(err)
            }
        }
    }
}

fn put_len(dst: &mut BytesMut, len: usize, what: &str) -> Result<(), BridgeError> {
    let len = i32::try_from(len)
        .map_err(|_| BridgeError::malformed(format!("{what} length {len} does not fit the wire")))?;
    dst.put_i32_le(len);
    Ok(())
}

fn put_extents(dst: &mut BytesMut, dims: &[usize]) -> Result<(), BridgeError> {
    for &extent in dims {
        put_len(dst, extent, "extent")?;
    }
    Ok(())
}

fn put_name(dst: &mut BytesMut, name: &Name) -> Result<(), BridgeError> {
    match name {
        Name::Literal(text) => {
            put_len(dst, text.len(), "name")?;
            dst.put_slice(text.as_bytes());
        }
        Name::Reference(handle) => dst.put_i32_le(handle.to_wire()),
    }
    Ok(())
}

fn put_header(dst: &mut BytesMut, kind: i32, aux: i32) {
    dst.put_i32_le(kind);
    dst.put_i32_le(aux);
}

fn put_args(dst: &mut BytesMut, args: &Args) -> Result<(), BridgeError> {
    put_header(dst, kind::LIST, 0);
    for item in &args.positional {
        put_message(dst, item)?;
    }
    for (key, value) in &args.named {
        put_set(dst, &Name::Literal(key.clone()), value)?;
    }
    put_header(dst, kind::EOL, 0);
    Ok(())
}

fn put_set(dst: &mut BytesMut, name: &Name, value: &Message) -> Result<(), BridgeError> {
    put_header(dst, kind::SET_VAR, name.tag());
    put_name(dst, name)?;
    put_message(dst, value)
}

fn put_message(dst: &mut BytesMut, message: &Message) -> Result<(), BridgeError> {
    match message {
        Message::Eol(flag) => put_header(dst, kind::EOL, flag.to_wire()),
        Message::Array(array) => {
            put_header(dst, array.elem().code(), array.rank() as i32);
            put_extents(dst, array.dims())?;
            array.encode_body(dst);
        }
        Message::Strings(strings) => {
            put_header(dst, kind::STRINGS, strings.rank() as i32);
            put_extents(dst, strings.dims())?;
            strings.encode_body(dst);
        }
        Message::Range(range) => {
            put_header(dst, kind::RANGE, range.style.flag());
            range.encode_body(dst);
        }
        Message::Nil => put_header(dst, kind::NIL, 0),
        Message::List(items) => {
            put_header(dst, kind::LIST, 0);
            for item in items {
                put_message(dst, item)?;
            }
            put_header(dst, kind::EOL, 0);
        }
        Message::Dict(entries) => {
            put_header(dst, kind::DICT, 0);
            for (key, value) in entries {
                put_set(dst, &Name::Literal(key.clone()), value)?;
            }
            put_header(dst, kind::EOL, 0);
        }
        Message::Reference(handle) => put_header(dst, kind::REFERENCE, handle.to_wire()),
        Message::Action(action) => put_action(dst, action)?,
    }
    Ok(())
}

fn put_action(dst: &mut BytesMut, action: &Action) -> Result<(), BridgeError> {
    match action {
        Action::Evaluate(text) | Action::Execute(text) => {
            let len = i32::try_from(text.len())
                .map_err(|_| BridgeError::malformed("request text too long"))?;
            put_header(dst, action.kind(), len);
            dst.put_slice(text.as_bytes());
        }
        Action::GetVar(name) | Action::GetShape(name) => {
            put_header(dst, action.kind(), name.tag());
            put_name(dst, name)?;
        }
        Action::SetVar { name, value } => put_set(dst, name, value)?,
        Action::Call {
            name,
            args,
            expect_result,
        } => {
            put_header(dst, kind::CALL, name.tag());
            put_name(dst, name)?;
            dst.put_i32_le(i32::from(*expect_result));
            put_args(dst, args)?;
        }
        Action::SubroutineCall { name, args } => {
            put_header(dst, kind::SUBROUTINE_CALL, name.tag());
            put_name(dst, name)?;
            put_args(dst, args)?;
        }
        Action::GetSlice { name, index } => {
            put_header(dst, kind::GET_SLICE, name.tag());
            put_name(dst, name)?;
            put_args(dst, index)?;
        }
        Action::SetSlice { name, index, value } => {
            put_header(dst, kind::SET_SLICE, name.tag());
            put_name(dst, name)?;
            put_args(dst, index)?;
            put_message(dst, value)?;
        }
        Action::Release(handle) => put_header(dst, kind::RELEASE, handle.to_wire()),
    }
    Ok(())
}

impl Encoder<Message> for MessageCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        if let Err(err) = put_message(dst, &item) {
            dst.truncate(start);
            return Err(err);
        }
        let written = dst.len() - start;
        if written > self.max_frame_bytes {
            dst.truncate(start);
            return Err(BridgeError::malformed(format!(
                "encoded frame of {written} bytes exceeds {}",
                self.max_frame_bytes
            )));
        }
        tracing::trace!(frame_bytes = written, kind = item.label(), "Encoded frame");
        Ok(())
    }
}
