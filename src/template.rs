/*! Template definitions and their runtime instances.

A [`TemplateDef`] is plain data: the ordered schema of one message
class, freely clonable and (de)serializable, so a catalog can live in
a JSON document next to the application config. Building a
[`TemplateSet`] turns definitions into live [`Template`] instances
that own the mutable per-field state.

A set belongs to one decoder or encoder. Sharing instances between
connections would leak one stream's field history into another, so
build a fresh set (cheap) per connection and share the definitions
instead.
*/

use serde::{Deserialize, Serialize};

use crate::field::{Decimal, Field, FieldState, Kind, Operator, Presence, Sequence, Slot};
use crate::{Error, Result};

/// Bit positions available in an eight-byte presence map.
const PMAP_MAX_BITS: usize = 56;

/// Declared reset value for a field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResetDef {
    /// Signed integer reset.
    Int(i64),
    /// Unsigned integer reset.
    Uint(u64),
    /// ASCII reset.
    Ascii(String),
    /// Unicode reset.
    Unicode(String),
    /// Decimal reset.
    Decimal(Decimal),
}

/// Declaration of a repeating group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceDef {
    /// The length field, with its own operator and presence.
    pub length: Box<FieldDef>,
    /// The element row: fields repeated per element.
    pub element: Vec<FieldDef>,
    /// Whether each element starts with its own presence map.
    #[serde(default)]
    pub element_pmap: bool,
}

/// Declaration of one template slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, unique within its template.
    pub name: String,
    /// Wire type.
    pub kind: Kind,
    /// Operator; defaults to [`Operator::None`].
    #[serde(default)]
    pub operator: Operator,
    /// Presence; defaults to [`Presence::Mandatory`].
    #[serde(default)]
    pub presence: Presence,
    /// Reset value, required by [`Operator::Constant`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<ResetDef>,
    /// Group declaration, for [`Kind::Sequence`] fields only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceDef>,
}

impl FieldDef {
    /// A mandatory field with no operator.
    #[must_use]
    pub fn new(name: &str, kind: Kind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            operator: Operator::None,
            presence: Presence::Mandatory,
            reset: None,
            sequence: None,
        }
    }

    /// Set the operator.
    #[must_use]
    pub fn with_operator(mut self, op: Operator) -> Self {
        self.operator = op;
        self
    }

    /// Make the field optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.presence = Presence::Optional;
        self
    }

    /// Set the reset value.
    #[must_use]
    pub fn with_reset(mut self, reset: ResetDef) -> Self {
        self.reset = Some(reset);
        self
    }

    /// Attach a group declaration.
    #[must_use]
    pub fn with_sequence(mut self, seq: SequenceDef) -> Self {
        self.sequence = Some(seq);
        self
    }
}

/// The ordered schema of one message class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateDef {
    /// Template id transmitted on the wire.
    pub tid: u32,
    /// Template name.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
}

/// Does this operator claim a presence-map slot?
fn needs_pmap_bit(op: Operator, presence: Presence) -> bool {
    match op {
        Operator::Copy | Operator::Increment => true,
        Operator::Constant => presence == Presence::Optional,
        Operator::None | Operator::Delta => false,
    }
}

fn bad(def: &FieldDef, what: &str) -> Error {
    Error::BadTemplate(format!("field '{}': {}", def.name, what))
}

fn build_slot(def: &FieldDef) -> Result<Slot> {
    let slot = match (def.kind, &def.reset) {
        (Kind::Int, None) => Slot::Int { value: 0, previous: 0, reset: None },
        (Kind::Int, Some(ResetDef::Int(r))) => Slot::Int {
            value: *r,
            previous: *r,
            reset: Some(*r),
        },
        (Kind::Uint, None) => Slot::Uint { value: 0, previous: 0, reset: None },
        (Kind::Uint, Some(ResetDef::Uint(r))) => Slot::Uint {
            value: *r,
            previous: *r,
            reset: Some(*r),
        },
        (Kind::Ascii, None) => Slot::Ascii {
            value: Vec::new(),
            previous: Vec::new(),
            reset: None,
        },
        (Kind::Ascii, Some(ResetDef::Ascii(r))) => Slot::Ascii {
            value: r.clone().into_bytes(),
            previous: r.clone().into_bytes(),
            reset: Some(r.clone().into_bytes()),
        },
        (Kind::Unicode, None) => Slot::Unicode {
            value: Vec::new(),
            previous: Vec::new(),
            reset: None,
        },
        (Kind::Unicode, Some(ResetDef::Unicode(r))) => Slot::Unicode {
            value: r.clone().into_bytes(),
            previous: r.clone().into_bytes(),
            reset: Some(r.clone().into_bytes()),
        },
        (Kind::Decimal, None) => Slot::Decimal {
            value: Decimal::default(),
            previous: Decimal::default(),
            reset: None,
        },
        (Kind::Decimal, Some(ResetDef::Decimal(r))) => Slot::Decimal {
            value: *r,
            previous: *r,
            reset: Some(*r),
        },
        (Kind::Sequence, _) => return Err(bad(def, "sequence built as scalar")),
        _ => return Err(bad(def, "reset value does not match field type")),
    };
    Ok(slot)
}

fn build_field(def: &FieldDef, next_bit: &mut usize, in_sequence: bool) -> Result<Field> {
    if def.kind == Kind::Sequence {
        if in_sequence {
            return Err(bad(def, "nested sequence"));
        }
        let Some(seq) = &def.sequence else {
            return Err(bad(def, "sequence without a group declaration"));
        };
        if seq.length.kind != Kind::Uint {
            return Err(bad(def, "sequence length must be an unsigned integer"));
        }
        let length = build_field(&seq.length, next_bit, true)?;
        let mut element_bit = 0;
        let row = seq
            .element
            .iter()
            .map(|fd| build_field(fd, &mut element_bit, true))
            .collect::<Result<Vec<_>>>()?;
        if !seq.element_pmap && element_bit > 0 {
            return Err(bad(def, "element operators need an element presence map"));
        }
        if element_bit > PMAP_MAX_BITS {
            return Err(bad(def, "too many element presence map bits"));
        }
        return Ok(Field {
            name: def.name.clone(),
            op: def.operator,
            presence: def.presence,
            pmap_bit: 0,
            state: FieldState::Undefined,
            state_previous: FieldState::Undefined,
            slot: Slot::Sequence(Box::new(Sequence {
                length,
                row,
                elements: Vec::new(),
                pmap_required: seq.element_pmap,
            })),
        });
    }

    let pmap_bit = if needs_pmap_bit(def.operator, def.presence) {
        let bit = *next_bit;
        *next_bit += 1;
        bit
    } else {
        0
    };
    Ok(Field {
        name: def.name.clone(),
        op: def.operator,
        presence: def.presence,
        pmap_bit,
        state: FieldState::Undefined,
        state_previous: FieldState::Undefined,
        slot: build_slot(def)?,
    })
}

/// A live template: the schema plus the mutable per-field state of
/// one stream.
#[derive(Clone, Debug)]
pub struct Template {
    pub(crate) tid: u32,
    pub(crate) name: String,
    pub(crate) fields: Vec<Field>,
}

impl Template {
    fn from_def(def: &TemplateDef) -> Result<Self> {
        // Bit 0 belongs to the template id.
        let mut next_bit = 1;
        let fields = def
            .fields
            .iter()
            .map(|fd| build_field(fd, &mut next_bit, false))
            .collect::<Result<Vec<_>>>()?;
        if next_bit > PMAP_MAX_BITS {
            return Err(Error::BadTemplate(format!(
                "template '{}': too many presence map bits",
                def.name
            )));
        }
        Ok(Self {
            tid: def.tid,
            name: def.name.clone(),
            fields,
        })
    }

    /// Template id.
    #[must_use]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field by name, mutably.
    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Forget all per-stream state: every field returns to its reset
    /// value (or the type default) and the undefined state.
    pub fn reset(&mut self) {
        for f in &mut self.fields {
            f.reset();
        }
    }
}

/// An ordered catalog of live templates, indexed by template id.
#[derive(Clone, Debug)]
pub struct TemplateSet {
    pub(crate) templates: Vec<Template>,
}

impl TemplateSet {
    /// Build live templates from definitions.
    pub fn new(defs: &[TemplateDef]) -> Result<Self> {
        let mut templates: Vec<Template> = Vec::with_capacity(defs.len());
        for def in defs {
            if templates.iter().any(|t| t.tid == def.tid) {
                return Err(Error::BadTemplate(format!(
                    "duplicate template id {}",
                    def.tid
                )));
            }
            templates.push(Template::from_def(def)?);
        }
        Ok(Self { templates })
    }

    /// Build live templates from a JSON array of definitions.
    pub fn from_json(text: &str) -> Result<Self> {
        let defs: Vec<TemplateDef> = serde_json::from_str(text)?;
        Self::new(&defs)
    }

    /// Look up a template by id.
    #[must_use]
    pub fn get(&self, tid: u32) -> Option<&Template> {
        self.templates.iter().find(|t| t.tid == tid)
    }

    /// Look up a template by id, mutably.
    pub fn get_mut(&mut self, tid: u32) -> Option<&mut Template> {
        self.templates.iter_mut().find(|t| t.tid == tid)
    }

    /// Position of the template matching a wire template id.
    pub(crate) fn position(&self, wire_tid: u64) -> Option<usize> {
        self.templates
            .iter()
            .position(|t| u64::from(t.tid) == wire_tid)
    }

    /// Reset every template in the set.
    pub fn reset(&mut self) {
        for t in &mut self.templates {
            t.reset();
        }
    }
}
