//! Typed payloads carried by wire messages.
//!
//! Numeric arrays keep their element buffer in a native typed vector. Complex elements
//! are stored as interleaved real/imaginary pairs, which callers see as an extra
//! trailing axis of extent 2 (see [`NumericArray::native_shape`]).

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Highest rank kept on decode. Extra axes fold into the last retained axis.
pub const MAX_RANK: usize = 10;

/// Numeric element type ids as they appear in a message's `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    U8,
    I16,
    I32,
    F32,
    F64,
    Complex32,
    Complex64,
    U16,
    U32,
    I64,
    U64,
    I8,
    /// Native extended-precision integer; 8 bytes on the wire.
    NativeInt,
    /// Long double. Recognised so it can be rejected, never decoded.
    LongDouble,
}

impl ElementType {
    pub const ALL: [ElementType; 14] = [
        Self::U8,
        Self::I16,
        Self::I32,
        Self::F32,
        Self::F64,
        Self::Complex32,
        Self::Complex64,
        Self::U16,
        Self::U32,
        Self::I64,
        Self::U64,
        Self::I8,
        Self::NativeInt,
        Self::LongDouble,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::U8,
            2 => Self::I16,
            3 => Self::I32,
            4 => Self::F32,
            5 => Self::F64,
            6 => Self::Complex32,
            9 => Self::Complex64,
            12 => Self::U16,
            13 => Self::U32,
            14 => Self::I64,
            15 => Self::U64,
            16 => Self::I8,
            17 => Self::NativeInt,
            18 => Self::LongDouble,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I32 => 3,
            Self::F32 => 4,
            Self::F64 => 5,
            Self::Complex32 => 6,
            Self::Complex64 => 9,
            Self::U16 => 12,
            Self::U32 => 13,
            Self::I64 => 14,
            Self::U64 => 15,
            Self::I8 => 16,
            Self::NativeInt => 17,
            Self::LongDouble => 18,
        }
    }

    /// Bytes per element on the wire (a complex element counts both halves).
    pub fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::Complex32 | Self::NativeInt => 8,
            Self::Complex64 | Self::LongDouble => 16,
        }
    }

    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex32 | Self::Complex64)
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::F32 | Self::F64 | Self::Complex32 | Self::Complex64
        )
    }

    /// Scalars stored per element: 2 for complex, 1 otherwise.
    pub fn lanes(self) -> usize {
        if self.is_complex() { 2 } else { 1 }
    }

    /// Fail for types this platform cannot represent exactly.
    pub fn ensure_supported(self) -> Result<(), BridgeError> {
        match self {
            Self::LongDouble => Err(BridgeError::UnsupportedType(
                "long double elements are not supported".to_string(),
            )),
            Self::NativeInt if usize::BITS < 64 => Err(BridgeError::UnsupportedType(format!(
                "extended-precision integers need a 64-bit native integer, platform has {} bits",
                usize::BITS
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Complex32 => "complex64",
            Self::Complex64 => "complex128",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::I8 => "i8",
            Self::NativeInt => "native-int",
            Self::LongDouble => "long-double",
        };
        f.write_str(name)
    }
}

/// Typed element buffer. Complex arrays use the float variants with interleaved pairs.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! for_each_lane {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ArrayData::U8($v) => $body,
            ArrayData::I8($v) => $body,
            ArrayData::I16($v) => $body,
            ArrayData::U16($v) => $body,
            ArrayData::I32($v) => $body,
            ArrayData::U32($v) => $body,
            ArrayData::I64($v) => $body,
            ArrayData::U64($v) => $body,
            ArrayData::F32($v) => $body,
            ArrayData::F64($v) => $body,
        }
    };
}

impl ArrayData {
    /// An all-zero buffer of `lanes` scalars laid out for `elem`.
    pub fn zeroed(elem: ElementType, lanes: usize) -> Self {
        match elem {
            ElementType::U8 => Self::U8(vec![0; lanes]),
            ElementType::I8 => Self::I8(vec![0; lanes]),
            ElementType::I16 => Self::I16(vec![0; lanes]),
            ElementType::U16 => Self::U16(vec![0; lanes]),
            ElementType::I32 => Self::I32(vec![0; lanes]),
            ElementType::U32 => Self::U32(vec![0; lanes]),
            ElementType::I64 | ElementType::NativeInt => Self::I64(vec![0; lanes]),
            ElementType::U64 => Self::U64(vec![0; lanes]),
            ElementType::F32 | ElementType::Complex32 => Self::F32(vec![0.0; lanes]),
            ElementType::F64 | ElementType::Complex64 | ElementType::LongDouble => {
                Self::F64(vec![0.0; lanes])
            }
        }
    }

    /// Number of stored scalars (twice the element count for complex data).
    pub fn lanes(&self) -> usize {
        for_each_lane!(self, v => v.len())
    }

    /// Whether this buffer can back an array of `elem`.
    fn matches(&self, elem: ElementType) -> bool {
        matches!(
            (self, elem),
            (Self::U8(_), ElementType::U8)
                | (Self::I8(_), ElementType::I8)
                | (Self::I16(_), ElementType::I16)
                | (Self::U16(_), ElementType::U16)
                | (Self::I32(_), ElementType::I32)
                | (Self::U32(_), ElementType::U32)
                | (Self::I64(_), ElementType::I64 | ElementType::NativeInt)
                | (Self::U64(_), ElementType::U64)
                | (Self::F32(_), ElementType::F32 | ElementType::Complex32)
                | (Self::F64(_), ElementType::F64 | ElementType::Complex64)
        )
    }

    pub fn lane_f64(&self, i: usize) -> Option<f64> {
        for_each_lane!(self, v => v.get(i).map(|x| *x as f64))
    }

    pub fn lane_i64(&self, i: usize) -> Option<i64> {
        for_each_lane!(self, v => v.get(i).map(|x| *x as i64))
    }

    /// Store a scalar, converting it to the buffer's lane type.
    pub fn set_lane(&mut self, i: usize, value: Scalar) {
        match self {
            Self::U8(v) => v[i] = value.as_i64() as u8,
            Self::I8(v) => v[i] = value.as_i64() as i8,
            Self::I16(v) => v[i] = value.as_i64() as i16,
            Self::U16(v) => v[i] = value.as_i64() as u16,
            Self::I32(v) => v[i] = value.as_i64() as i32,
            Self::U32(v) => v[i] = value.as_i64() as u32,
            Self::I64(v) => v[i] = value.as_i64(),
            Self::U64(v) => v[i] = value.as_i64() as u64,
            Self::F32(v) => v[i] = value.as_f64() as f32,
            Self::F64(v) => v[i] = value.as_f64(),
        }
    }

    pub fn lane(&self, i: usize) -> Option<Scalar> {
        match self {
            Self::F32(_) | Self::F64(_) => self.lane_f64(i).map(Scalar::Float),
            _ => self.lane_i64(i).map(Scalar::Int),
        }
    }

    /// Copy out the lanes at `indices`, keeping the lane type.
    pub fn gather(&self, indices: &[usize]) -> Self {
        match self {
            Self::U8(v) => Self::U8(indices.iter().map(|&i| v[i]).collect()),
            Self::I8(v) => Self::I8(indices.iter().map(|&i| v[i]).collect()),
            Self::I16(v) => Self::I16(indices.iter().map(|&i| v[i]).collect()),
            Self::U16(v) => Self::U16(indices.iter().map(|&i| v[i]).collect()),
            Self::I32(v) => Self::I32(indices.iter().map(|&i| v[i]).collect()),
            Self::U32(v) => Self::U32(indices.iter().map(|&i| v[i]).collect()),
            Self::I64(v) => Self::I64(indices.iter().map(|&i| v[i]).collect()),
            Self::U64(v) => Self::U64(indices.iter().map(|&i| v[i]).collect()),
            Self::F32(v) => Self::F32(indices.iter().map(|&i| v[i]).collect()),
            Self::F64(v) => Self::F64(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    fn read(elem: ElementType, lanes: usize, buf: &mut impl Buf) -> Self {
        match elem {
            ElementType::U8 => Self::U8((0..lanes).map(|_| buf.get_u8()).collect()),
            ElementType::I8 => Self::I8((0..lanes).map(|_| buf.get_i8()).collect()),
            ElementType::I16 => Self::I16((0..lanes).map(|_| buf.get_i16_le()).collect()),
            ElementType::U16 => Self::U16((0..lanes).map(|_| buf.get_u16_le()).collect()),
            ElementType::I32 => Self::I32((0..lanes).map(|_| buf.get_i32_le()).collect()),
            ElementType::U32 => Self::U32((0..lanes).map(|_| buf.get_u32_le()).collect()),
            ElementType::I64 | ElementType::NativeInt => {
                Self::I64((0..lanes).map(|_| buf.get_i64_le()).collect())
            }
            ElementType::U64 => Self::U64((0..lanes).map(|_| buf.get_u64_le()).collect()),
            ElementType::F32 | ElementType::Complex32 => {
                Self::F32((0..lanes).map(|_| buf.get_f32_le()).collect())
            }
            ElementType::F64 | ElementType::Complex64 | ElementType::LongDouble => {
                Self::F64((0..lanes).map(|_| buf.get_f64_le()).collect())
            }
        }
    }

    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::U8(v) => v.iter().for_each(|x| buf.put_u8(*x)),
            Self::I8(v) => v.iter().for_each(|x| buf.put_i8(*x)),
            Self::I16(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
            Self::U16(v) => v.iter().for_each(|x| buf.put_u16_le(*x)),
            Self::I32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
            Self::U32(v) => v.iter().for_each(|x| buf.put_u32_le(*x)),
            Self::I64(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
            Self::U64(v) => v.iter().for_each(|x| buf.put_u64_le(*x)),
            Self::F32(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
            Self::F64(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
        }
    }
}

/// One numeric lane, widened for arithmetic and conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int(v) => v,
            Self::Float(v) => v as i64,
        }
    }
}

/// Product of extents, or `None` on overflow.
pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
}

/// Collapse axes past [`MAX_RANK`] into the last retained axis.
pub fn fold_rank(mut dims: Vec<usize>) -> Result<Vec<usize>, BridgeError> {
    if dims.len() <= MAX_RANK {
        return Ok(dims);
    }
    let folded = element_count(&dims[MAX_RANK - 1..])
        .ok_or_else(|| BridgeError::malformed("folded extent overflows"))?;
    dims.truncate(MAX_RANK);
    dims[MAX_RANK - 1] = folded;
    Ok(dims)
}

/// An n-dimensional numeric array. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    elem: ElementType,
    dims: Vec<usize>,
    data: ArrayData,
}

impl NumericArray {
    /// Build an array, checking that the buffer fits `elem` and `dims`.
    pub fn new(elem: ElementType, dims: Vec<usize>, data: ArrayData) -> Result<Self, BridgeError> {
        elem.ensure_supported()?;
        if dims.contains(&0) {
            return Err(BridgeError::malformed("array extents must be positive"));
        }
        if !data.matches(elem) {
            return Err(BridgeError::malformed(format!(
                "buffer does not hold {elem} elements"
            )));
        }
        let dims = fold_rank(dims)?;
        let lanes = element_count(&dims)
            .and_then(|count| count.checked_mul(elem.lanes()))
            .ok_or_else(|| BridgeError::malformed("element count overflows"))?;
        if lanes != data.lanes() {
            return Err(BridgeError::malformed(format!(
                "{} lanes do not fill extents {:?}",
                data.lanes(),
                dims
            )));
        }
        Ok(Self { elem, dims, data })
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self {
            elem: ElementType::I64,
            dims: Vec::new(),
            data: ArrayData::I64(vec![value]),
        }
    }

    pub fn scalar_f64(value: f64) -> Self {
        Self {
            elem: ElementType::F64,
            dims: Vec::new(),
            data: ArrayData::F64(vec![value]),
        }
    }

    pub fn from_i64s(values: Vec<i64>) -> Self {
        Self {
            elem: ElementType::I64,
            dims: vec![values.len().max(1)],
            data: if values.is_empty() {
                ArrayData::I64(vec![0])
            } else {
                ArrayData::I64(values)
            },
        }
    }

    pub fn from_f64s(values: Vec<f64>) -> Self {
        Self {
            elem: ElementType::F64,
            dims: vec![values.len().max(1)],
            data: if values.is_empty() {
                ArrayData::F64(vec![0.0])
            } else {
                ArrayData::F64(values)
            },
        }
    }

    pub fn elem(&self) -> ElementType {
        self.elem
    }

    /// Extents as carried on the wire, fastest axis first.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Extents as seen natively: complex arrays gain a trailing axis of extent 2.
    pub fn native_shape(&self) -> Vec<usize> {
        let mut shape = self.dims.clone();
        if self.elem.is_complex() {
            shape.push(2);
        }
        shape
    }

    pub fn len(&self) -> usize {
        self.data.lanes() / self.elem.lanes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayData {
        &mut self.data
    }

    pub fn into_parts(self) -> (ElementType, Vec<usize>, ArrayData) {
        (self.elem, self.dims, self.data)
    }

    /// Real part (or value) of element `i`.
    pub fn get(&self, i: usize) -> Option<Scalar> {
        self.data.lane(i * self.elem.lanes())
    }

    /// Element values widened to f64 (real parts for complex arrays).
    pub fn to_f64s(&self) -> Vec<f64> {
        (0..self.len())
            .filter_map(|i| self.get(i).map(Scalar::as_f64))
            .collect()
    }

    pub(crate) fn decode_body(
        elem: ElementType,
        dims: Vec<usize>,
        buf: &mut impl Buf,
    ) -> Result<Self, BridgeError> {
        elem.ensure_supported()?;
        let lanes = element_count(&dims)
            .and_then(|count| count.checked_mul(elem.lanes()))
            .ok_or_else(|| BridgeError::malformed("element count overflows"))?;
        let data = ArrayData::read(elem, lanes, buf);
        Ok(Self {
            elem,
            dims: fold_rank(dims)?,
            data,
        })
    }

    pub(crate) fn encode_body(&self, buf: &mut impl BufMut) {
        self.data.write(buf);
    }
}

/// An n-dimensional array of optional strings.
///
/// On the wire each element has a length-table entry: 0 for an absent element,
/// otherwise the byte length plus one, so an entry of exactly 1 is the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringArray {
    dims: Vec<usize>,
    items: Vec<Option<String>>,
}

impl StringArray {
    pub fn new(dims: Vec<usize>, items: Vec<Option<String>>) -> Result<Self, BridgeError> {
        if dims.contains(&0) {
            return Err(BridgeError::malformed("array extents must be positive"));
        }
        let dims = fold_rank(dims)?;
        let count = element_count(&dims)
            .ok_or_else(|| BridgeError::malformed("element count overflows"))?;
        if count != items.len() {
            return Err(BridgeError::malformed(format!(
                "{} strings do not fill extents {:?}",
                items.len(),
                dims
            )));
        }
        Ok(Self { dims, items })
    }

    pub fn scalar(value: impl Into<String>) -> Self {
        Self {
            dims: Vec::new(),
            items: vec![Some(value.into())],
        }
    }

    pub fn from_strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<Option<String>> = values.into_iter().map(|s| Some(s.into())).collect();
        if items.is_empty() {
            return Self {
                dims: vec![1],
                items: vec![None],
            };
        }
        Self {
            dims: vec![items.len()],
            items,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn items(&self) -> &[Option<String>] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [Option<String>] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// The single string of a rank-0 array.
    pub fn as_scalar(&self) -> Option<&str> {
        if self.is_scalar() {
            self.items.first().and_then(|s| s.as_deref())
        } else {
            None
        }
    }

    pub(crate) fn decode_body(dims: Vec<usize>, buf: &mut impl Buf) -> Result<Self, BridgeError> {
        let count = element_count(&dims)
            .ok_or_else(|| BridgeError::malformed("element count overflows"))?;
        let lengths: Vec<i32> = (0..count).map(|_| buf.get_i32_le()).collect();
        let mut items = Vec::with_capacity(count);
        for declared in lengths {
            let item = match declared {
                0 => None,
                n if n > 0 => {
                    let bytes = buf.copy_to_bytes((n - 1) as usize);
                    let text = String::from_utf8(bytes.to_vec())
                        .map_err(|_| BridgeError::malformed("string element is not UTF-8"))?;
                    Some(text)
                }
                n => {
                    return Err(BridgeError::malformed(format!(
                        "negative string length {n}"
                    )));
                }
            };
            items.push(item);
        }
        Ok(Self {
            dims: fold_rank(dims)?,
            items,
        })
    }

    pub(crate) fn encode_body(&self, buf: &mut impl BufMut) {
        for item in &self.items {
            let declared = item.as_ref().map_or(0, |s| s.len() as i32 + 1);
            buf.put_i32_le(declared);
        }
        for item in self.items.iter().flatten() {
            buf.put_slice(item.as_bytes());
        }
    }
}

/// How a range's bounds are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStyle {
    /// `start:stop`, stop excluded.
    Slice,
    /// `start..stop`, stop included.
    Inclusive,
}

impl RangeStyle {
    pub fn from_flag(flag: i32) -> Option<Self> {
        match flag {
            0 => Some(Self::Slice),
            1 => Some(Self::Inclusive),
            _ => None,
        }
    }

    pub fn flag(self) -> i32 {
        match self {
            Self::Slice => 0,
            Self::Inclusive => 1,
        }
    }
}

/// A start/stop/step triple. A step of `None` goes over the wire as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: i64,
    pub stop: i64,
    pub step: Option<i64>,
    pub style: RangeStyle,
}

impl RangeSpec {
    pub fn slice(start: i64, stop: i64) -> Self {
        Self {
            start,
            stop,
            step: None,
            style: RangeStyle::Slice,
        }
    }

    pub fn inclusive(start: i64, stop: i64) -> Self {
        Self {
            start,
            stop,
            step: None,
            style: RangeStyle::Inclusive,
        }
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = (step != 0).then_some(step);
        self
    }

    /// Positions selected along an axis of length `len`. Negative bounds count from the end.
    ///
    /// Bounds past either end are clamped, so any endpoint or step a peer sends is safe.
    pub fn positions(&self, len: usize) -> Vec<usize> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let step = self.step.unwrap_or(1);
        let norm = |v: i64| if v < 0 { v.saturating_add(len) } else { v };
        let mut stop = norm(self.stop);
        if self.style == RangeStyle::Inclusive {
            stop = stop.saturating_add(step.signum());
        }

        // Forward walks stay in [0, len], backward walks in [-1, len - 1].
        let (lo, hi) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let stop = stop.clamp(lo, hi);
        let mut i = norm(self.start).clamp(lo, hi);

        let mut out = Vec::new();
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
        out
    }

    pub(crate) fn decode_body(style: RangeStyle, buf: &mut impl Buf) -> Self {
        let start = buf.get_i64_le();
        let stop = buf.get_i64_le();
        let step = buf.get_i64_le();
        Self {
            start,
            stop,
            step: (step != 0).then_some(step),
            style,
        }
    }

    pub(crate) fn encode_body(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.start);
        buf.put_i64_le(self.stop);
        buf.put_i64_le(self.step.unwrap_or(0));
    }
}
