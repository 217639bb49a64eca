/*! Field slots and their cross-message state.

A FAST field is more than a value: it remembers the previously
transmitted value, an optional reset value from the template, and an
assignment state, because most operators reconstruct the current value
from that memory instead of reading the wire. The slot survives from
message to message; that memory is the protocol's entire reason for
existing.
*/

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Highest element count a sequence may carry before the stream is
/// declared garbled.
pub const SEQUENCE_MAX_ELEMENTS: usize = 64;

/// Wire type of a field slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Stop-bit signed integer.
    Int,
    /// Stop-bit unsigned integer.
    Uint,
    /// Stop-bit ASCII string.
    Ascii,
    /// Length-prefixed byte string.
    Unicode,
    /// Scaled decimal: exponent then mantissa.
    Decimal,
    /// Repeating group with its own length field.
    Sequence,
}

/// Field operator: how the value relates to prior state and to the
/// presence map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Value is always on the wire.
    #[default]
    None,
    /// Absent value repeats the previous one.
    Copy,
    /// Absent value is the previous one plus one.
    Increment,
    /// Wire carries a signed difference from the previous value.
    Delta,
    /// Value is fixed by the template.
    Constant,
}

/// Whether a field may legally be empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    /// The field always carries a value.
    #[default]
    Mandatory,
    /// The field may be absent; null augmentation applies on the wire.
    Optional,
}

/// Assignment state of a field slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldState {
    /// No value has ever been assigned.
    #[default]
    Undefined,
    /// The slot holds a value.
    Assigned,
    /// The field was explicitly absent.
    Empty,
}

/// Scaled decimal as transmitted: the value is `mnt * 10^exp`.
///
/// Never normalized and never turned into a float; the exponent must
/// stay within ±63 on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decimal {
    /// Power-of-ten exponent.
    pub exp: i64,
    /// Mantissa.
    pub mnt: i64,
}

/// A decoded field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// ASCII string.
    Ascii(Vec<u8>),
    /// Unicode byte string.
    Unicode(Vec<u8>),
    /// Scaled decimal.
    Decimal(Decimal),
}

/// Typed storage for a slot: current value, previous value, reset
/// value. One variant per wire type.
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    Int {
        value: i64,
        previous: i64,
        reset: Option<i64>,
    },
    Uint {
        value: u64,
        previous: u64,
        reset: Option<u64>,
    },
    Ascii {
        value: Vec<u8>,
        previous: Vec<u8>,
        reset: Option<Vec<u8>>,
    },
    Unicode {
        value: Vec<u8>,
        previous: Vec<u8>,
        reset: Option<Vec<u8>>,
    },
    Decimal {
        value: Decimal,
        previous: Decimal,
        reset: Option<Decimal>,
    },
    Sequence(Box<Sequence>),
}

impl Slot {
    pub(crate) fn kind(&self) -> Kind {
        match self {
            Slot::Int { .. } => Kind::Int,
            Slot::Uint { .. } => Kind::Uint,
            Slot::Ascii { .. } => Kind::Ascii,
            Slot::Unicode { .. } => Kind::Unicode,
            Slot::Decimal { .. } => Kind::Decimal,
            Slot::Sequence(_) => Kind::Sequence,
        }
    }
}

/// One field slot of a template instance.
#[derive(Clone, Debug)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) op: Operator,
    pub(crate) presence: Presence,
    /// Position in the presence map; meaningful only when `op`
    /// consumes a slot.
    pub(crate) pmap_bit: usize,
    pub(crate) state: FieldState,
    pub(crate) state_previous: FieldState,
    pub(crate) slot: Slot,
}

impl Field {
    /// Field name as declared in the template.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire type.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.slot.kind()
    }

    /// Declared operator.
    #[must_use]
    pub fn operator(&self) -> Operator {
        self.op
    }

    /// Mandatory or optional.
    #[must_use]
    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Current assignment state.
    #[must_use]
    pub fn state(&self) -> FieldState {
        self.state
    }

    pub(crate) fn is_mandatory(&self) -> bool {
        self.presence == Presence::Mandatory
    }

    fn assigned(&self) -> bool {
        self.state == FieldState::Assigned
    }

    /// Unsigned value, if assigned.
    #[must_use]
    pub fn uint(&self) -> Option<u64> {
        match &self.slot {
            Slot::Uint { value, .. } if self.assigned() => Some(*value),
            _ => None,
        }
    }

    /// Signed value, if assigned.
    #[must_use]
    pub fn int(&self) -> Option<i64> {
        match &self.slot {
            Slot::Int { value, .. } if self.assigned() => Some(*value),
            _ => None,
        }
    }

    /// ASCII value, if assigned.
    #[must_use]
    pub fn ascii(&self) -> Option<&[u8]> {
        match &self.slot {
            Slot::Ascii { value, .. } if self.assigned() => Some(value),
            _ => None,
        }
    }

    /// Unicode value, if assigned.
    #[must_use]
    pub fn unicode(&self) -> Option<&[u8]> {
        match &self.slot {
            Slot::Unicode { value, .. } if self.assigned() => Some(value),
            _ => None,
        }
    }

    /// Decimal value, if assigned.
    #[must_use]
    pub fn decimal(&self) -> Option<Decimal> {
        match &self.slot {
            Slot::Decimal { value, .. } if self.assigned() => Some(*value),
            _ => None,
        }
    }

    /// The sequence behind this field, if it is one.
    #[must_use]
    pub fn sequence(&self) -> Option<&Sequence> {
        match &self.slot {
            Slot::Sequence(seq) => Some(seq),
            _ => None,
        }
    }

    /// Mutable access to the sequence behind this field.
    pub fn sequence_mut(&mut self) -> Option<&mut Sequence> {
        match &mut self.slot {
            Slot::Sequence(seq) => Some(seq),
            _ => None,
        }
    }

    /// The assigned value, if any. Sequences have no scalar value.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        if !self.assigned() {
            return None;
        }
        match &self.slot {
            Slot::Int { value, .. } => Some(Value::Int(*value)),
            Slot::Uint { value, .. } => Some(Value::Uint(*value)),
            Slot::Ascii { value, .. } => Some(Value::Ascii(value.clone())),
            Slot::Unicode { value, .. } => Some(Value::Unicode(value.clone())),
            Slot::Decimal { value, .. } => Some(Value::Decimal(*value)),
            Slot::Sequence(_) => None,
        }
    }

    /// Assign an unsigned value.
    ///
    /// Panics if the field is not a [`Kind::Uint`].
    pub fn set_uint(&mut self, v: u64) {
        let Slot::Uint { value, .. } = &mut self.slot else {
            panic!("set_uint on {:?} field {}", self.kind(), self.name);
        };
        *value = v;
        self.state = FieldState::Assigned;
    }

    /// Assign a signed value.
    ///
    /// Panics if the field is not a [`Kind::Int`].
    pub fn set_int(&mut self, v: i64) {
        let Slot::Int { value, .. } = &mut self.slot else {
            panic!("set_int on {:?} field {}", self.kind(), self.name);
        };
        *value = v;
        self.state = FieldState::Assigned;
    }

    /// Assign an ASCII value.
    ///
    /// Panics if the field is not a [`Kind::Ascii`].
    pub fn set_ascii(&mut self, v: &[u8]) {
        let Slot::Ascii { value, .. } = &mut self.slot else {
            panic!("set_ascii on {:?} field {}", self.kind(), self.name);
        };
        *value = v.to_vec();
        self.state = FieldState::Assigned;
    }

    /// Assign a unicode value.
    ///
    /// Panics if the field is not a [`Kind::Unicode`].
    pub fn set_unicode(&mut self, v: &[u8]) {
        let Slot::Unicode { value, .. } = &mut self.slot else {
            panic!("set_unicode on {:?} field {}", self.kind(), self.name);
        };
        *value = v.to_vec();
        self.state = FieldState::Assigned;
    }

    /// Assign a decimal value.
    ///
    /// Panics if the field is not a [`Kind::Decimal`].
    pub fn set_decimal(&mut self, v: Decimal) {
        let Slot::Decimal { value, .. } = &mut self.slot else {
            panic!("set_decimal on {:?} field {}", self.kind(), self.name);
        };
        *value = v;
        self.state = FieldState::Assigned;
    }

    /// Mark the field explicitly absent for the next encode.
    pub fn set_empty(&mut self) {
        self.state = FieldState::Empty;
    }

    /// A pristine copy of this slot: same declaration, no state.
    #[must_use]
    pub(crate) fn blank(&self) -> Field {
        let mut f = self.clone();
        f.reset();
        f
    }

    /// Restore the declared reset value (or the type default) and
    /// forget all per-stream state.
    pub fn reset(&mut self) {
        self.state = FieldState::Undefined;
        self.state_previous = FieldState::Undefined;
        match &mut self.slot {
            Slot::Int { value, previous, reset } => {
                *value = reset.unwrap_or_default();
                *previous = *value;
            }
            Slot::Uint { value, previous, reset } => {
                *value = reset.unwrap_or_default();
                *previous = *value;
            }
            Slot::Ascii { value, previous, reset }
            | Slot::Unicode { value, previous, reset } => {
                *value = reset.clone().unwrap_or_default();
                *previous = value.clone();
            }
            Slot::Decimal { value, previous, reset } => {
                *value = reset.unwrap_or_default();
                *previous = *value;
            }
            Slot::Sequence(seq) => seq.reset(),
        }
    }

    /// Copy the staged value and state out of `other`, which must be a
    /// replica of this slot.
    pub(crate) fn adopt(&mut self, other: &Field) -> Result<()> {
        match (&mut self.slot, &other.slot) {
            (Slot::Int { value, .. }, Slot::Int { value: v, .. }) => *value = *v,
            (Slot::Uint { value, .. }, Slot::Uint { value: v, .. }) => *value = *v,
            (Slot::Ascii { value, .. }, Slot::Ascii { value: v, .. })
            | (Slot::Unicode { value, .. }, Slot::Unicode { value: v, .. }) => {
                value.clone_from(v);
            }
            (Slot::Decimal { value, .. }, Slot::Decimal { value: v, .. }) => *value = *v,
            _ => return Err(Error::Garbled("element field type mismatch")),
        }
        self.state = other.state;
        Ok(())
    }
}

/// A repeating group: a length field plus decoded element instances.
///
/// The element *row* is the live copy of the element template; its
/// fields carry operator state from element to element, exactly as
/// top-level fields carry state from message to message. Decoded
/// values are replicated into [`Sequence::elements`].
#[derive(Clone, Debug)]
pub struct Sequence {
    pub(crate) length: Field,
    pub(crate) row: Vec<Field>,
    pub(crate) elements: Vec<Vec<Field>>,
    pub(crate) pmap_required: bool,
}

impl Sequence {
    /// Number of decoded (or staged) elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when the sequence holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The decoded element instances.
    #[must_use]
    pub fn elements(&self) -> &[Vec<Field>] {
        &self.elements
    }

    /// The length field, with its own operator and state.
    #[must_use]
    pub fn length(&self) -> &Field {
        &self.length
    }

    /// Drop all staged or decoded elements.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Stage a fresh element for encoding and return it for value
    /// assignment.
    pub fn push_element(&mut self) -> &mut Vec<Field> {
        self.elements.push(self.row.iter().map(Field::blank).collect());
        let last = self.elements.len() - 1;
        &mut self.elements[last]
    }

    pub(crate) fn reset(&mut self) {
        self.length.reset();
        for f in &mut self.row {
            f.reset();
        }
        self.elements.clear();
    }
}
