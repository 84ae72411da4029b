//! Values held by a symbol table, and the indexing rules shared by every table.
//!
//! [`Value`] mirrors the passive half of [`Message`] plus [`Value::Opaque`], which has
//! no wire form. Converting a value tree that contains an opaque value anywhere yields
//! `None`; the session then holds the whole value behind a reference handle.
//!
//! Indexing follows the wire layout: extents are fastest axis first. A single index
//! addresses the flattened buffer; one index per axis addresses the array by axis.
//! Integer indices may be negative and then count from the end.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::bridge::protocol::{Message, kind};
use crate::bridge::types::{
    ArrayData, ElementType, NumericArray, RangeSpec, RangeStyle, Scalar, StringArray,
};
use crate::error::{BridgeError, EvalError};
use crate::refs::Handle;

/// A value that cannot cross the wire, such as a callable.
#[derive(Clone)]
pub struct Opaque {
    type_name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(type_name: impl Into<String>, value: T) -> Self {
        Self {
            type_name: type_name.into(),
            inner: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.type_name)
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Array(NumericArray),
    Strings(StringArray),
    Range(RangeSpec),
    List(Vec<Value>),
    /// Ordered entries; keys may repeat and member access takes the first match.
    Dict(Vec<(String, Value)>),
    Opaque(Opaque),
}

impl Value {
    pub fn int(value: i64) -> Self {
        Self::Array(NumericArray::scalar_i64(value))
    }

    pub fn float(value: f64) -> Self {
        Self::Array(NumericArray::scalar_f64(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Strings(StringArray::scalar(value))
    }

    pub fn ints(values: Vec<i64>) -> Self {
        Self::Array(NumericArray::from_i64s(values))
    }

    pub fn floats(values: Vec<f64>) -> Self {
        Self::Array(NumericArray::from_f64s(values))
    }

    pub fn type_name(&self) -> String {
        match self {
            Self::Nil => "nil".to_string(),
            Self::Array(a) => format!("{} array", a.elem()),
            Self::Strings(_) => "string array".to_string(),
            Self::Range(_) => "range".to_string(),
            Self::List(_) => "list".to_string(),
            Self::Dict(_) => "dict".to_string(),
            Self::Opaque(o) => o.type_name().to_string(),
        }
    }

    /// Integer value of a one-element numeric array.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Array(a) if a.len() == 1 && !a.elem().is_float() => a.get(0).map(Scalar::as_i64),
            Self::Array(a) if a.len() == 1 => a
                .get(0)
                .map(Scalar::as_f64)
                .filter(|v| v.fract() == 0.0)
                .map(|v| v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Array(a) if a.len() == 1 => a.get(0).map(Scalar::as_f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Strings(s) => s.as_scalar(),
            _ => None,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }

    /// Wire form of this value, or `None` if an opaque value occurs anywhere in it.
    pub fn to_message(&self) -> Option<Message> {
        Some(match self {
            Self::Nil => Message::Nil,
            Self::Array(a) => Message::Array(a.clone()),
            Self::Strings(s) => Message::Strings(s.clone()),
            Self::Range(r) => Message::Range(*r),
            Self::List(items) => {
                Message::List(items.iter().map(Value::to_message).collect::<Option<_>>()?)
            }
            Self::Dict(entries) => Message::Dict(
                entries
                    .iter()
                    .map(|(k, v)| v.to_message().map(|m| (k.clone(), m)))
                    .collect::<Option<_>>()?,
            ),
            Self::Opaque(_) => return None,
        })
    }

    /// Value carried by a passive message. References are looked up with `resolve`.
    pub fn from_message(
        message: Message,
        resolve: &mut impl FnMut(Handle) -> Result<Value, BridgeError>,
    ) -> Result<Value, BridgeError> {
        Ok(match message {
            Message::Nil => Value::Nil,
            Message::Array(a) => Value::Array(a),
            Message::Strings(s) => Value::Strings(s),
            Message::Range(r) => Value::Range(r),
            Message::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|m| Value::from_message(m, resolve))
                    .collect::<Result<_, _>>()?,
            ),
            Message::Dict(entries) => Value::Dict(
                entries
                    .into_iter()
                    .map(|(k, m)| Value::from_message(m, resolve).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?,
            ),
            Message::Reference(handle) => resolve(handle)?,
            Message::Eol(flag) => {
                return Err(BridgeError::violation(format!(
                    "EOL({}) where a value was expected",
                    flag.to_wire()
                )));
            }
            Message::Action(action) => {
                return Err(BridgeError::violation(format!(
                    "{} request where a value was expected",
                    action.label()
                )));
            }
        })
    }

    /// First dict entry named `key`.
    pub fn member(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn member_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Self::Dict(entries) => entries
                .iter_mut()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Shape descriptor: `[type_id, rank, extents...]` as an i64 array.
    pub fn shape(&self) -> Value {
        let fields = match self {
            Self::Array(a) => descriptor(a.elem().code(), a.dims()),
            Self::Strings(s) => descriptor(kind::STRINGS, s.dims()),
            Self::List(items) => descriptor(kind::LIST, &[items.len()]),
            Self::Dict(entries) => descriptor(kind::DICT, &[entries.len()]),
            Self::Range(_) => descriptor(kind::RANGE, &[]),
            Self::Nil => descriptor(kind::NIL, &[]),
            Self::Opaque(_) => descriptor(kind::REFERENCE, &[]),
        };
        Value::ints(fields)
    }

    /// Read the elements selected by `index`.
    pub fn get_index(&self, index: &[Index]) -> Result<Value, EvalError> {
        match self {
            Self::Array(array) => {
                let selection = Selection::resolve(array.dims(), array.len(), index)?;
                let lanes = array.elem().lanes();
                let picked: Vec<usize> = selection
                    .offsets
                    .iter()
                    .flat_map(|o| (0..lanes).map(move |l| o * lanes + l))
                    .collect();
                let data = array.data().gather(&picked);
                NumericArray::new(array.elem(), selection.dims, data)
                    .map(Value::Array)
                    .map_err(|e| EvalError::failed(e.to_string()))
            }
            Self::Strings(strings) => {
                let selection = Selection::resolve(strings.dims(), strings.len(), index)?;
                let items = selection
                    .offsets
                    .iter()
                    .map(|&o| strings.items()[o].clone())
                    .collect();
                StringArray::new(selection.dims, items)
                    .map(Value::Strings)
                    .map_err(|e| EvalError::failed(e.to_string()))
            }
            Self::List(items) => match index {
                [Index::At(i)] => Ok(items[position(*i, items.len())?].clone()),
                [Index::Range(r)] => Ok(Value::List(
                    r.positions(items.len())
                        .into_iter()
                        .map(|p| items[p].clone())
                        .collect(),
                )),
                _ => Err(EvalError::type_mismatch(format!(
                    "lists take one index, got {}",
                    index.len()
                ))),
            },
            other => Err(EvalError::type_mismatch(format!(
                "cannot index a {}",
                other.type_name()
            ))),
        }
    }

    /// Assign `source` to the elements selected by `index`.
    ///
    /// A one-element source is broadcast; otherwise the element counts must match.
    /// Numeric sources are converted to this array's element type.
    pub fn set_index(&mut self, index: &[Index], source: Value) -> Result<(), EvalError> {
        match self {
            Self::Array(dest) => {
                let src = match source {
                    Value::Array(src) => src,
                    other => {
                        return Err(EvalError::type_mismatch(format!(
                            "cannot assign a {} into a numeric array",
                            other.type_name()
                        )));
                    }
                };
                let selection = Selection::resolve(dest.dims(), dest.len(), index)?;
                check_count(src.len(), selection.offsets.len())?;
                let dest_lanes = dest.elem().lanes();
                let src_lanes = src.elem().lanes();
                for (i, &offset) in selection.offsets.iter().enumerate() {
                    let j = if src.len() == 1 { 0 } else { i };
                    for lane in 0..dest_lanes {
                        let value = if lane < src_lanes {
                            src.data().lane(j * src_lanes + lane)
                        } else {
                            Some(Scalar::Int(0))
                        };
                        if let Some(value) = value {
                            dest.data_mut().set_lane(offset * dest_lanes + lane, value);
                        }
                    }
                }
                Ok(())
            }
            Self::Strings(dest) => {
                let src = match source {
                    Value::Strings(src) => src,
                    other => {
                        return Err(EvalError::type_mismatch(format!(
                            "cannot assign a {} into a string array",
                            other.type_name()
                        )));
                    }
                };
                let selection = Selection::resolve(dest.dims(), dest.len(), index)?;
                check_count(src.len(), selection.offsets.len())?;
                for (i, &offset) in selection.offsets.iter().enumerate() {
                    let j = if src.len() == 1 { 0 } else { i };
                    dest.items_mut()[offset] = src.items()[j].clone();
                }
                Ok(())
            }
            Self::List(items) => match index {
                [Index::At(i)] => {
                    let p = position(*i, items.len())?;
                    items[p] = source;
                    Ok(())
                }
                [Index::Range(r)] => {
                    let targets = r.positions(items.len());
                    let values = match source {
                        Value::List(values) => values,
                        single => vec![single; targets.len()],
                    };
                    check_count(values.len(), targets.len())?;
                    for (p, v) in targets.into_iter().zip(values) {
                        items[p] = v;
                    }
                    Ok(())
                }
                _ => Err(EvalError::type_mismatch(format!(
                    "lists take one index, got {}",
                    index.len()
                ))),
            },
            other => Err(EvalError::type_mismatch(format!(
                "cannot assign into a {}",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Array(a) => {
                let items: Vec<String> = (0..a.len())
                    .filter_map(|i| a.get(i))
                    .map(|s| match s {
                        Scalar::Int(v) => v.to_string(),
                        Scalar::Float(v) => v.to_string(),
                    })
                    .collect();
                if a.is_scalar() {
                    f.write_str(&items.join(""))
                } else {
                    write!(f, "[{}]", items.join(", "))?;
                    if a.rank() > 1 {
                        let dims: Vec<String> = a.dims().iter().map(|d| d.to_string()).collect();
                        write!(f, " ({})", dims.join("x"))?;
                    }
                    Ok(())
                }
            }
            Self::Strings(s) => {
                let items: Vec<String> = s
                    .items()
                    .iter()
                    .map(|item| match item {
                        Some(text) => format!("{text:?}"),
                        None => "<absent>".to_string(),
                    })
                    .collect();
                if s.is_scalar() {
                    f.write_str(&items.join(""))
                } else {
                    write!(f, "[{}]", items.join(", "))
                }
            }
            Self::Range(r) => {
                let sep = match r.style {
                    RangeStyle::Slice => ":",
                    RangeStyle::Inclusive => "..",
                };
                write!(f, "{}{sep}{}", r.start, r.stop)?;
                if let Some(step) = r.step {
                    write!(f, ":{step}")?;
                }
                Ok(())
            }
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Self::Opaque(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}

fn descriptor(type_id: i32, dims: &[usize]) -> Vec<i64> {
    let mut out = vec![i64::from(type_id), dims.len() as i64];
    out.extend(dims.iter().map(|d| *d as i64));
    out
}

fn check_count(source: usize, targets: usize) -> Result<(), EvalError> {
    if source == 1 || source == targets {
        Ok(())
    } else {
        Err(EvalError::type_mismatch(format!(
            "cannot assign {source} elements to {targets} positions"
        )))
    }
}

fn position(index: i64, len: usize) -> Result<usize, EvalError> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::IndexOutOfRange(format!(
            "index {index} for length {len}"
        )));
    }
    Ok(resolved as usize)
}

/// One element of an index list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    At(i64),
    Range(RangeSpec),
}

impl Index {
    pub fn from_value(value: &Value) -> Result<Self, EvalError> {
        match value {
            Value::Range(r) => Ok(Index::Range(*r)),
            other => other.as_i64().map(Index::At).ok_or_else(|| {
                EvalError::type_mismatch(format!("cannot index with a {}", other.type_name()))
            }),
        }
    }

    fn positions(&self, len: usize) -> Result<Vec<usize>, EvalError> {
        match self {
            Index::At(i) => Ok(vec![position(*i, len)?]),
            Index::Range(r) => Ok(r.positions(len)),
        }
    }
}

struct Selection {
    offsets: Vec<usize>,
    dims: Vec<usize>,
}

impl Selection {
    fn resolve(dims: &[usize], len: usize, index: &[Index]) -> Result<Self, EvalError> {
        let (axes, lens): (Vec<Index>, Vec<usize>) = match index {
            [single] if dims.len() != 1 => (vec![*single], vec![len]),
            _ if index.len() == dims.len() => (index.to_vec(), dims.to_vec()),
            _ => {
                return Err(EvalError::type_mismatch(format!(
                    "expected 1 or {} indices, got {}",
                    dims.len(),
                    index.len()
                )));
            }
        };

        let mut offsets = vec![0usize];
        let mut out_dims = Vec::new();
        let mut stride = 1usize;
        for (axis, axis_len) in axes.iter().zip(&lens) {
            let positions = axis.positions(*axis_len)?;
            if positions.is_empty() {
                return Err(EvalError::IndexOutOfRange("empty selection".to_string()));
            }
            if matches!(axis, Index::Range(_)) {
                out_dims.push(positions.len());
            }
            offsets = positions
                .iter()
                .flat_map(|p| offsets.iter().map(move |o| o + p * stride))
                .collect();
            stride *= axis_len;
        }
        Ok(Self {
            offsets,
            dims: out_dims,
        })
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::string(value)
    }
}

impl From<ElementType> for Value {
    fn from(elem: ElementType) -> Self {
        Value::string(elem.to_string())
    }
}

/// Build a numeric array of `elem` from f64 values, converting each one.
pub fn array_of(elem: ElementType, dims: Vec<usize>, values: &[f64]) -> Result<Value, BridgeError> {
    let mut data = ArrayData::zeroed(elem, values.len() * elem.lanes());
    for (i, v) in values.iter().enumerate() {
        data.set_lane(i * elem.lanes(), Scalar::Float(*v));
    }
    NumericArray::new(elem, dims, data).map(Value::Array)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_refs(handle: Handle) -> Result<Value, BridgeError> {
        Err(crate::error::ReferenceError::NotHeld(handle).into())
    }

    fn matrix() -> Value {
        // 3 columns fastest, 2 rows: [[0,1,2],[3,4,5]]
        array_of(ElementType::I32, vec![3, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap()
    }

    #[test]
    fn flat_index_addresses_buffer() {
        let m = matrix();
        assert_eq!(m.get_index(&[Index::At(4)]).unwrap().as_i64(), Some(4));
        assert_eq!(m.get_index(&[Index::At(-1)]).unwrap().as_i64(), Some(5));
        assert!(matches!(
            m.get_index(&[Index::At(6)]),
            Err(EvalError::IndexOutOfRange(_))
        ));
    }

    #[test]
    fn per_axis_index_is_fastest_first() {
        let m = matrix();
        let v = m.get_index(&[Index::At(2), Index::At(1)]).unwrap();
        assert_eq!(v.as_i64(), Some(5));

        let Value::Array(row) = m
            .get_index(&[Index::Range(RangeSpec::slice(0, 3)), Index::At(1)])
            .unwrap()
        else {
            panic!("expected array");
        };
        assert_eq!(row.dims(), &[3]);
        assert_eq!(row.elem(), ElementType::I32);
        assert_eq!(row.to_f64s(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn set_slice_broadcasts_and_casts() {
        let mut v = Value::ints(vec![0, 0, 0, 0, 0]);
        v.set_index(&[Index::Range(RangeSpec::slice(1, 3))], Value::ints(vec![9, 9]))
            .unwrap();
        assert_eq!(v, Value::ints(vec![0, 9, 9, 0, 0]));

        v.set_index(&[Index::Range(RangeSpec::slice(0, 5).with_step(2))], Value::float(7.9))
            .unwrap();
        assert_eq!(v, Value::ints(vec![7, 9, 7, 0, 7]));

        let err = v
            .set_index(&[Index::Range(RangeSpec::slice(0, 2))], Value::ints(vec![1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, EvalError::Type(_)));
    }

    #[test]
    fn list_indexing() {
        let mut list = Value::List(vec![Value::int(1), Value::string("two"), Value::Nil]);
        assert_eq!(list.get_index(&[Index::At(1)]).unwrap(), Value::string("two"));
        assert_eq!(
            list.get_index(&[Index::Range(RangeSpec::slice(0, 2))]).unwrap(),
            Value::List(vec![Value::int(1), Value::string("two")])
        );
        list.set_index(&[Index::At(-1)], Value::float(3.5)).unwrap();
        assert_eq!(list.get_index(&[Index::At(2)]).unwrap(), Value::float(3.5));
    }

    #[test]
    fn dict_member_takes_first_match() {
        let dict = Value::Dict(vec![
            ("k".into(), Value::int(1)),
            ("k".into(), Value::int(2)),
        ]);
        assert_eq!(dict.member("k"), Some(&Value::int(1)));
        assert_eq!(dict.member("x"), None);
    }

    #[test]
    fn shape_descriptors() {
        assert_eq!(matrix().shape(), Value::ints(vec![3, 2, 3, 2]));
        assert_eq!(Value::int(1).shape(), Value::ints(vec![14, 0]));
        assert_eq!(
            Value::List(vec![Value::Nil, Value::Nil]).shape(),
            Value::ints(vec![22, 1, 2])
        );
        assert_eq!(Value::Nil.shape(), Value::ints(vec![20, 0]));
    }

    #[test]
    fn display() {
        assert_eq!(Value::int(2).to_string(), "2");
        assert_eq!(Value::ints(vec![1, 2]).to_string(), "[1, 2]");
        assert_eq!(matrix().to_string(), "[0, 1, 2, 3, 4, 5] (3x2)");
        assert_eq!(Value::string("hi").to_string(), "\"hi\"");
        assert_eq!(
            Value::Dict(vec![("a".into(), Value::List(vec![Value::Nil]))]).to_string(),
            "{a: [nil]}"
        );
        assert_eq!(Value::Range(RangeSpec::slice(1, 3)).to_string(), "1:3");
    }

    #[test]
    fn opaque_anywhere_makes_value_unencodable() {
        let f = Value::Opaque(Opaque::new("function", 42u8));
        assert!(f.to_message().is_none());
        let nested = Value::List(vec![Value::int(1), Value::Dict(vec![("f".into(), f)])]);
        assert!(nested.to_message().is_none());
        assert!(Value::List(vec![Value::int(1)]).to_message().is_some());
    }

    #[test]
    fn opaque_equality_is_identity() {
        let a = Opaque::new("function", 1u8);
        let b = Opaque::new("function", 1u8);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downcast_ref::<u8>(), Some(&1));
    }

    #[test]
    fn from_message_rejects_requests_in_value_position() {
        let msg = Message::List(vec![Message::Action(
            crate::bridge::protocol::Action::Evaluate("1".into()),
        )]);
        let err = Value::from_message(msg, &mut no_refs).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolViolation(_)));
    }

    #[test]
    fn from_message_resolves_references() {
        let handle = Handle::from_wire(3).unwrap();
        let mut resolve = |h: Handle| {
            assert_eq!(h, handle);
            Ok(Value::int(11))
        };
        let v = Value::from_message(Message::List(vec![Message::Reference(handle)]), &mut resolve)
            .unwrap();
        assert_eq!(v, Value::List(vec![Value::int(11)]));
    }
}
