/*! Message decoding.

Drives one message through the pipeline: presence map, template id,
then every field in declaration order through the operator engine.
Absent fields are reconstructed from the state their slot carried out
of the previous message, which is why a [`Decoder`] owns its template
instances outright.

Any error abandons the current message. Field state mutated before
the failure stays mutated; a caller that wants to carry on over the
same stream should resynchronize at an outer frame boundary or reset
the template.
*/

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::field::{
    Decimal, Field, FieldState, Kind, Operator, SEQUENCE_MAX_ELEMENTS, Slot,
};
use crate::pmap::Pmap;
use crate::stopbit;
use crate::template::{Template, TemplateSet};
use crate::{Error, Result};

/// Read one unsigned value off the wire, with null augmentation for
/// optional fields: zero means empty, anything else is one high.
fn read_uint(
    buf: &mut Buffer,
    mandatory: bool,
    value: &mut u64,
    state: &mut FieldState,
) -> Result<()> {
    let wire = stopbit::parse_uint(buf)?;
    *state = FieldState::Assigned;
    *value = wire;
    if !mandatory {
        if wire == 0 {
            *state = FieldState::Empty;
        } else {
            *value = wire - 1;
        }
    }
    Ok(())
}

/// Signed counterpart of [`read_uint`]: only non-negative wire values
/// are null-augmented.
fn read_int(
    buf: &mut Buffer,
    mandatory: bool,
    value: &mut i64,
    state: &mut FieldState,
) -> Result<()> {
    let wire = stopbit::parse_int(buf)?;
    *state = FieldState::Assigned;
    *value = wire;
    if !mandatory {
        if wire == 0 {
            *state = FieldState::Empty;
        } else if wire > 0 {
            *value = wire - 1;
        }
    }
    Ok(())
}

/// Read one ASCII value. The lone stop byte decodes as a single NUL
/// character: the null string for optional fields, the empty string
/// for mandatory ones.
fn read_ascii(
    buf: &mut Buffer,
    mandatory: bool,
    value: &mut Vec<u8>,
    state: &mut FieldState,
) -> Result<()> {
    let s = stopbit::parse_ascii(buf)?;
    *state = FieldState::Assigned;
    if s == [0] {
        if mandatory {
            value.clear();
        } else {
            *state = FieldState::Empty;
        }
    } else {
        *value = s;
    }
    Ok(())
}

/// Read one unicode value: null-augmented length, then raw bytes.
fn read_unicode(
    buf: &mut Buffer,
    mandatory: bool,
    value: &mut Vec<u8>,
    state: &mut FieldState,
) -> Result<()> {
    let wire = stopbit::parse_uint(buf)?;
    *state = FieldState::Assigned;
    let mut len = wire;
    if !mandatory {
        if wire == 0 {
            *state = FieldState::Empty;
            return Ok(());
        }
        len = wire - 1;
    }
    if len > stopbit::STRING_MAX_BYTES as u64 {
        return Err(Error::Garbled("unicode string too long"));
    }
    *value = stopbit::parse_bytes(buf, len as usize)?;
    Ok(())
}

/// Read one decimal: exponent (null-augmented) then mantissa.
fn read_decimal(
    buf: &mut Buffer,
    mandatory: bool,
    value: &mut Decimal,
    state: &mut FieldState,
) -> Result<()> {
    let mut exp = stopbit::parse_int(buf)?;
    *state = FieldState::Assigned;
    if !mandatory {
        if exp == 0 {
            *state = FieldState::Empty;
            return Ok(());
        }
        if exp > 0 {
            exp -= 1;
        }
    }
    if !(-63..=63).contains(&exp) {
        return Err(Error::Garbled("decimal exponent out of range"));
    }
    let mnt = stopbit::parse_int(buf)?;
    *value = Decimal { exp, mnt };
    Ok(())
}

fn decode_uint(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Uint { value, reset, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in uint decoder"));
    };
    match field.op {
        Operator::None => read_uint(buf, mandatory, value, &mut field.state)?,
        Operator::Copy | Operator::Increment => {
            if pmap.is_set(field.pmap_bit) {
                read_uint(buf, mandatory, value, &mut field.state)?;
            } else {
                match field.state {
                    FieldState::Undefined => match *reset {
                        Some(r) => {
                            field.state = FieldState::Assigned;
                            *value = r;
                        }
                        None if mandatory => {
                            return Err(Error::Garbled("no prior value for mandatory field"));
                        }
                        None => field.state = FieldState::Empty,
                    },
                    FieldState::Assigned => {
                        if field.op == Operator::Increment {
                            *value = value.wrapping_add(1);
                        }
                    }
                    FieldState::Empty => {
                        if mandatory {
                            return Err(Error::Garbled("empty value for mandatory field"));
                        }
                    }
                }
            }
        }
        Operator::Delta => {
            let delta = stopbit::parse_int(buf)?;
            field.state = FieldState::Assigned;
            *value = value.wrapping_add_signed(delta);
            if !mandatory {
                if delta == 0 {
                    field.state = FieldState::Empty;
                } else if delta > 0 {
                    *value = value.wrapping_sub(1);
                }
            }
        }
        Operator::Constant => {
            if field.state != FieldState::Assigned {
                let Some(r) = *reset else {
                    return Err(Error::Garbled("constant field without a declared value"));
                };
                *value = r;
            }
            field.state = FieldState::Assigned;
            if !mandatory && !pmap.is_set(field.pmap_bit) {
                field.state = FieldState::Empty;
            }
        }
    }
    Ok(())
}

fn decode_int(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Int { value, reset, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in int decoder"));
    };
    match field.op {
        Operator::None => read_int(buf, mandatory, value, &mut field.state)?,
        Operator::Copy | Operator::Increment => {
            if pmap.is_set(field.pmap_bit) {
                read_int(buf, mandatory, value, &mut field.state)?;
            } else {
                match field.state {
                    FieldState::Undefined => match *reset {
                        Some(r) => {
                            field.state = FieldState::Assigned;
                            *value = r;
                        }
                        None if mandatory => {
                            return Err(Error::Garbled("no prior value for mandatory field"));
                        }
                        None => field.state = FieldState::Empty,
                    },
                    FieldState::Assigned => {
                        if field.op == Operator::Increment {
                            *value = value.wrapping_add(1);
                        }
                    }
                    FieldState::Empty => {
                        if mandatory {
                            return Err(Error::Garbled("empty value for mandatory field"));
                        }
                    }
                }
            }
        }
        Operator::Delta => {
            let delta = stopbit::parse_int(buf)?;
            field.state = FieldState::Assigned;
            *value = value.wrapping_add(delta);
            if !mandatory {
                if delta == 0 {
                    field.state = FieldState::Empty;
                } else if delta > 0 {
                    *value = value.wrapping_sub(1);
                }
            }
        }
        Operator::Constant => {
            if field.state != FieldState::Assigned {
                let Some(r) = *reset else {
                    return Err(Error::Garbled("constant field without a declared value"));
                };
                *value = r;
            }
            field.state = FieldState::Assigned;
            if !mandatory && !pmap.is_set(field.pmap_bit) {
                field.state = FieldState::Empty;
            }
        }
    }
    Ok(())
}

fn decode_ascii(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Ascii { value, reset, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in string decoder"));
    };
    match field.op {
        Operator::None => read_ascii(buf, mandatory, value, &mut field.state)?,
        Operator::Copy => {
            if pmap.is_set(field.pmap_bit) {
                read_ascii(buf, mandatory, value, &mut field.state)?;
            } else {
                match field.state {
                    FieldState::Undefined => match reset {
                        Some(r) => {
                            field.state = FieldState::Assigned;
                            value.clone_from(r);
                        }
                        None if mandatory => {
                            return Err(Error::Garbled("no prior value for mandatory field"));
                        }
                        None => field.state = FieldState::Empty,
                    },
                    FieldState::Assigned => {}
                    FieldState::Empty => {
                        if mandatory {
                            return Err(Error::Garbled("empty value for mandatory field"));
                        }
                    }
                }
            }
        }
        Operator::Increment | Operator::Delta => {
            return Err(Error::Garbled("operator not valid for string"));
        }
        Operator::Constant => {
            if field.state != FieldState::Assigned {
                let Some(r) = reset else {
                    return Err(Error::Garbled("constant field without a declared value"));
                };
                value.clone_from(r);
            }
            field.state = FieldState::Assigned;
            if !mandatory && !pmap.is_set(field.pmap_bit) {
                field.state = FieldState::Empty;
            }
        }
    }
    Ok(())
}

fn decode_unicode(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Unicode { value, reset, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in string decoder"));
    };
    match field.op {
        Operator::None => read_unicode(buf, mandatory, value, &mut field.state)?,
        Operator::Copy => {
            if pmap.is_set(field.pmap_bit) {
                read_unicode(buf, mandatory, value, &mut field.state)?;
            } else {
                match field.state {
                    FieldState::Undefined => match reset {
                        Some(r) => {
                            field.state = FieldState::Assigned;
                            value.clone_from(r);
                        }
                        None if mandatory => {
                            return Err(Error::Garbled("no prior value for mandatory field"));
                        }
                        None => field.state = FieldState::Empty,
                    },
                    FieldState::Assigned => {}
                    FieldState::Empty => {
                        if mandatory {
                            return Err(Error::Garbled("empty value for mandatory field"));
                        }
                    }
                }
            }
        }
        Operator::Increment | Operator::Delta => {
            return Err(Error::Garbled("operator not valid for string"));
        }
        Operator::Constant => {
            if field.state != FieldState::Assigned {
                let Some(r) = reset else {
                    return Err(Error::Garbled("constant field without a declared value"));
                };
                value.clone_from(r);
            }
            field.state = FieldState::Assigned;
            if !mandatory && !pmap.is_set(field.pmap_bit) {
                field.state = FieldState::Empty;
            }
        }
    }
    Ok(())
}

fn decode_decimal(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Decimal { value, reset, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in decimal decoder"));
    };
    match field.op {
        Operator::None => read_decimal(buf, mandatory, value, &mut field.state)?,
        Operator::Copy => {
            if pmap.is_set(field.pmap_bit) {
                read_decimal(buf, mandatory, value, &mut field.state)?;
            } else {
                match field.state {
                    FieldState::Undefined => match *reset {
                        Some(r) => {
                            field.state = FieldState::Assigned;
                            *value = r;
                        }
                        None if mandatory => {
                            return Err(Error::Garbled("no prior value for mandatory field"));
                        }
                        None => field.state = FieldState::Empty,
                    },
                    FieldState::Assigned => {}
                    FieldState::Empty => {
                        if mandatory {
                            return Err(Error::Garbled("empty value for mandatory field"));
                        }
                    }
                }
            }
        }
        Operator::Increment => {
            return Err(Error::Garbled("increment not valid for decimal"));
        }
        Operator::Delta => {
            let d = stopbit::parse_int(buf)?;
            field.state = FieldState::Assigned;
            value.exp = value.exp.wrapping_add(d);
            if !mandatory {
                if d == 0 {
                    field.state = FieldState::Empty;
                    return Ok(());
                }
                if d > 0 {
                    value.exp = value.exp.wrapping_sub(1);
                }
            }
            if !(-63..=63).contains(&value.exp) {
                return Err(Error::Garbled("decimal exponent out of range"));
            }
            let m = stopbit::parse_int(buf)?;
            value.mnt = value.mnt.wrapping_add(m);
        }
        Operator::Constant => {
            if field.state != FieldState::Assigned {
                let Some(r) = *reset else {
                    return Err(Error::Garbled("constant field without a declared value"));
                };
                *value = r;
            }
            field.state = FieldState::Assigned;
            if !mandatory && !pmap.is_set(field.pmap_bit) {
                field.state = FieldState::Empty;
            }
        }
    }
    Ok(())
}

fn decode_sequence(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Sequence(seq) = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in sequence decoder"));
    };
    decode_uint(buf, pmap, &mut seq.length)?;
    seq.elements.clear();
    if seq.length.state == FieldState::Empty {
        if mandatory {
            return Err(Error::Garbled("empty length on mandatory sequence"));
        }
        field.state = FieldState::Empty;
        return Ok(());
    }
    let count = seq.length.uint().unwrap_or(0);
    if count >= SEQUENCE_MAX_ELEMENTS as u64 {
        return Err(Error::Garbled("sequence too long"));
    }
    for _ in 0..count {
        let epmap = if seq.pmap_required {
            Pmap::parse(buf)?
        } else {
            Pmap::empty()
        };
        for f in &mut seq.row {
            if f.kind() == Kind::Sequence {
                return Err(Error::Garbled("nested sequence"));
            }
            decode_field(buf, &epmap, f)?;
        }
        let decoded = seq.row.clone();
        seq.elements.push(decoded);
    }
    field.state = seq.length.state;
    Ok(())
}

/// Decode one field, dispatching on its wire type.
pub(crate) fn decode_field(buf: &mut Buffer, pmap: &Pmap, field: &mut Field) -> Result<()> {
    trace!("decode field {} ({:?}/{:?})", field.name, field.kind(), field.op);
    match field.kind() {
        Kind::Int => decode_int(buf, pmap, field),
        Kind::Uint => decode_uint(buf, pmap, field),
        Kind::Ascii => decode_ascii(buf, pmap, field),
        Kind::Unicode => decode_unicode(buf, pmap, field),
        Kind::Decimal => decode_decimal(buf, pmap, field),
        Kind::Sequence => decode_sequence(buf, pmap, field),
    }
}

/// Streaming FAST decoder: a template set plus the drive loop.
pub struct Decoder {
    templates: TemplateSet,
}

impl Decoder {
    /// Create a decoder owning `templates`.
    #[must_use]
    pub fn new(templates: TemplateSet) -> Self {
        Self { templates }
    }

    /// The owned template set.
    #[must_use]
    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// The owned template set, mutably (for resets).
    pub fn templates_mut(&mut self) -> &mut TemplateSet {
        &mut self.templates
    }

    /// Decode one message from `buf`.
    ///
    /// `last_tid` is used when the presence map says the template id
    /// was not transmitted. Returns the template with all fields
    /// assigned or empty.
    pub fn decode(&mut self, buf: &mut Buffer, last_tid: u64) -> Result<&Template> {
        let pmap = Pmap::parse(buf)?;
        let tid = if pmap.is_set(0) {
            stopbit::parse_uint(buf)?
        } else {
            last_tid
        };
        let Some(idx) = self.templates.position(tid) else {
            warn!("message for unknown template id {tid}");
            return Err(Error::UnknownTemplate(tid));
        };
        let tmpl = &mut self.templates.templates[idx];
        debug!("decode message: template {} ({})", tmpl.tid, tmpl.name);
        for field in &mut tmpl.fields {
            decode_field(buf, &pmap, field)?;
        }
        Ok(&self.templates.templates[idx])
    }
}
