/*! Message encoding.

The mirror image of [`crate::decode`]: each field's operator decides
whether to put a value on the wire, whether to flag its presence-map
bit, and how to roll the slot's previous value forward. The driver
collects the body and the map separately, trims the map, and hands
both regions to a gather write so the caller controls framing.

The template id is always transmitted (presence-map bit 0 forced on).
*/

use log::{debug, trace};

use crate::buffer::{Buffer, MESSAGE_MAX_SIZE};
use crate::field::{
    Field, FieldState, Kind, Operator, SEQUENCE_MAX_ELEMENTS, Sequence, Slot,
};
use crate::pmap::{PMAP_MAX_BYTES, Pmap};
use crate::stopbit;
use crate::template::{Template, TemplateSet};
use crate::{Error, Result};

fn set_bit(pmap: &mut Pmap, bit: usize) -> Result<()> {
    if pmap.set(bit) {
        Ok(())
    } else {
        Err(Error::Garbled("presence map bit out of range"))
    }
}

fn encode_uint(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Uint { value, previous, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in uint encoder"));
    };
    match field.op {
        Operator::None => {
            if !mandatory && field.state == FieldState::Empty {
                *value = *previous;
                field.state_previous = field.state;
                stopbit::transfer_uint(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let wire = if mandatory { *value } else { value.wrapping_add(1) };
                *previous = *value;
                field.state_previous = field.state;
                stopbit::transfer_uint(buf, wire)?;
            }
        }
        Operator::Copy | Operator::Increment => {
            if !mandatory && field.state == FieldState::Empty {
                *value = *previous;
                field.state_previous = field.state;
                stopbit::transfer_uint(buf, 0)?;
                set_bit(pmap, field.pmap_bit)?;
            } else {
                let emit = match field.state {
                    FieldState::Undefined => {
                        field.state = FieldState::Assigned;
                        true
                    }
                    FieldState::Assigned => {
                        if field.state_previous != FieldState::Assigned {
                            true
                        } else if field.op == Operator::Increment {
                            if *value == previous.wrapping_add(1) {
                                *previous = previous.wrapping_add(1);
                                false
                            } else {
                                true
                            }
                        } else {
                            *value != *previous
                        }
                    }
                    FieldState::Empty => {
                        return Err(Error::Garbled("empty value for mandatory field"));
                    }
                };
                if emit {
                    let wire = if mandatory { *value } else { value.wrapping_add(1) };
                    *previous = *value;
                    field.state_previous = field.state;
                    stopbit::transfer_uint(buf, wire)?;
                    set_bit(pmap, field.pmap_bit)?;
                }
            }
        }
        Operator::Delta => {
            if !mandatory && field.state == FieldState::Empty {
                *value = *previous;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let mut delta = (*value as i64).wrapping_sub(*previous as i64);
                if !mandatory && delta >= 0 {
                    delta = delta.wrapping_add(1);
                }
                *previous = *value;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, delta)?;
            }
        }
        Operator::Constant => {
            if !mandatory {
                if field.state == FieldState::Empty {
                    return Ok(());
                }
                set_bit(pmap, field.pmap_bit)?;
            }
            field.state = FieldState::Assigned;
        }
    }
    Ok(())
}

fn encode_int(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Int { value, previous, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in int encoder"));
    };
    // Null augmentation shifts non-negative values up by one.
    fn augment(v: i64, mandatory: bool) -> i64 {
        if mandatory || v < 0 { v } else { v.wrapping_add(1) }
    }
    match field.op {
        Operator::None => {
            if !mandatory && field.state == FieldState::Empty {
                *value = *previous;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let wire = augment(*value, mandatory);
                *previous = *value;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, wire)?;
            }
        }
        Operator::Copy | Operator::Increment => {
            if !mandatory && field.state == FieldState::Empty {
                *value = *previous;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
                set_bit(pmap, field.pmap_bit)?;
            } else {
                let emit = match field.state {
                    FieldState::Undefined => {
                        field.state = FieldState::Assigned;
                        true
                    }
                    FieldState::Assigned => {
                        if field.state_previous != FieldState::Assigned {
                            true
                        } else if field.op == Operator::Increment {
                            if *value == previous.wrapping_add(1) {
                                *previous = previous.wrapping_add(1);
                                false
                            } else {
                                true
                            }
                        } else {
                            *value != *previous
                        }
                    }
                    FieldState::Empty => {
                        return Err(Error::Garbled("empty value for mandatory field"));
                    }
                };
                if emit {
                    let wire = augment(*value, mandatory);
                    *previous = *value;
                    field.state_previous = field.state;
                    stopbit::transfer_int(buf, wire)?;
                    set_bit(pmap, field.pmap_bit)?;
                }
            }
        }
        Operator::Delta => {
            if !mandatory && field.state == FieldState::Empty {
                *value = *previous;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let wire = augment(value.wrapping_sub(*previous), mandatory);
                *previous = *value;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, wire)?;
            }
        }
        Operator::Constant => {
            if !mandatory {
                if field.state == FieldState::Empty {
                    return Ok(());
                }
                set_bit(pmap, field.pmap_bit)?;
            }
            field.state = FieldState::Assigned;
        }
    }
    Ok(())
}

fn encode_ascii(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Ascii { value, previous, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in string encoder"));
    };
    match field.op {
        Operator::None => {
            if !mandatory && field.state == FieldState::Empty {
                value.clone_from(previous);
                field.state_previous = field.state;
                stopbit::transfer_ascii(buf, None)?;
            } else {
                field.state = FieldState::Assigned;
                previous.clone_from(value);
                field.state_previous = field.state;
                stopbit::transfer_ascii(buf, Some(value.as_slice()))?;
            }
        }
        Operator::Copy => {
            if !mandatory && field.state == FieldState::Empty {
                value.clone_from(previous);
                field.state_previous = field.state;
                stopbit::transfer_ascii(buf, None)?;
                set_bit(pmap, field.pmap_bit)?;
            } else {
                let emit = match field.state {
                    FieldState::Undefined => {
                        field.state = FieldState::Assigned;
                        true
                    }
                    FieldState::Assigned => {
                        field.state_previous != FieldState::Assigned || value != previous
                    }
                    FieldState::Empty => {
                        return Err(Error::Garbled("empty value for mandatory field"));
                    }
                };
                if emit {
                    previous.clone_from(value);
                    field.state_previous = field.state;
                    stopbit::transfer_ascii(buf, Some(value.as_slice()))?;
                    set_bit(pmap, field.pmap_bit)?;
                }
            }
        }
        Operator::Increment | Operator::Delta => {
            return Err(Error::Garbled("operator not valid for string"));
        }
        Operator::Constant => {
            if !mandatory {
                if field.state == FieldState::Empty {
                    return Ok(());
                }
                set_bit(pmap, field.pmap_bit)?;
            }
            field.state = FieldState::Assigned;
        }
    }
    Ok(())
}

fn encode_unicode(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Unicode { value, previous, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in string encoder"));
    };
    // Length rides the null augmentation; the body is raw.
    match field.op {
        Operator::None => {
            if !mandatory && field.state == FieldState::Empty {
                value.clone_from(previous);
                field.state_previous = field.state;
                stopbit::transfer_uint(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let len = value.len() as u64 + u64::from(!mandatory);
                previous.clone_from(value);
                field.state_previous = field.state;
                stopbit::transfer_uint(buf, len)?;
                stopbit::transfer_bytes(buf, value)?;
            }
        }
        Operator::Copy => {
            if !mandatory && field.state == FieldState::Empty {
                value.clone_from(previous);
                field.state_previous = field.state;
                stopbit::transfer_uint(buf, 0)?;
                set_bit(pmap, field.pmap_bit)?;
            } else {
                let emit = match field.state {
                    FieldState::Undefined => {
                        field.state = FieldState::Assigned;
                        true
                    }
                    FieldState::Assigned => {
                        field.state_previous != FieldState::Assigned || value != previous
                    }
                    FieldState::Empty => {
                        return Err(Error::Garbled("empty value for mandatory field"));
                    }
                };
                if emit {
                    let len = value.len() as u64 + u64::from(!mandatory);
                    previous.clone_from(value);
                    field.state_previous = field.state;
                    stopbit::transfer_uint(buf, len)?;
                    stopbit::transfer_bytes(buf, value)?;
                    set_bit(pmap, field.pmap_bit)?;
                }
            }
        }
        Operator::Increment | Operator::Delta => {
            return Err(Error::Garbled("operator not valid for string"));
        }
        Operator::Constant => {
            if !mandatory {
                if field.state == FieldState::Empty {
                    return Ok(());
                }
                set_bit(pmap, field.pmap_bit)?;
            }
            field.state = FieldState::Assigned;
        }
    }
    Ok(())
}

fn encode_decimal(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Decimal { value, previous, .. } = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in decimal encoder"));
    };
    match field.op {
        Operator::None => {
            if !mandatory && field.state == FieldState::Empty {
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let mut exp = value.exp;
                if !mandatory && exp >= 0 {
                    exp = exp.wrapping_add(1);
                }
                *previous = *value;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, exp)?;
                stopbit::transfer_int(buf, value.mnt)?;
            }
        }
        Operator::Copy => {
            if !mandatory && field.state == FieldState::Empty {
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
                set_bit(pmap, field.pmap_bit)?;
            } else {
                let emit = match field.state {
                    FieldState::Undefined => {
                        field.state = FieldState::Assigned;
                        true
                    }
                    FieldState::Assigned => {
                        field.state_previous != FieldState::Assigned || *value != *previous
                    }
                    FieldState::Empty => {
                        return Err(Error::Garbled("empty value for mandatory field"));
                    }
                };
                if emit {
                    let mut exp = value.exp;
                    if !mandatory && exp >= 0 {
                        exp = exp.wrapping_add(1);
                    }
                    *previous = *value;
                    field.state_previous = field.state;
                    stopbit::transfer_int(buf, exp)?;
                    stopbit::transfer_int(buf, value.mnt)?;
                    set_bit(pmap, field.pmap_bit)?;
                }
            }
        }
        Operator::Increment => {
            return Err(Error::Garbled("increment not valid for decimal"));
        }
        Operator::Delta => {
            if !mandatory && field.state == FieldState::Empty {
                field.state_previous = field.state;
                stopbit::transfer_int(buf, 0)?;
            } else {
                field.state = FieldState::Assigned;
                let mut exp = value.exp.wrapping_sub(previous.exp);
                let mnt = value.mnt.wrapping_sub(previous.mnt);
                if !mandatory && exp >= 0 {
                    exp = exp.wrapping_add(1);
                }
                *previous = *value;
                field.state_previous = field.state;
                stopbit::transfer_int(buf, exp)?;
                stopbit::transfer_int(buf, mnt)?;
            }
        }
        Operator::Constant => {
            if !mandatory {
                if field.state == FieldState::Empty {
                    return Ok(());
                }
                set_bit(pmap, field.pmap_bit)?;
            }
            field.state = FieldState::Assigned;
        }
    }
    Ok(())
}

fn encode_sequence(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    let mandatory = field.is_mandatory();
    let Slot::Sequence(seq) = &mut field.slot else {
        return Err(Error::Garbled("type mismatch in sequence encoder"));
    };
    if field.state == FieldState::Empty {
        if mandatory {
            return Err(Error::Garbled("empty value for mandatory sequence"));
        }
        if seq.length.is_mandatory() {
            return Err(Error::Garbled("empty sequence with mandatory length"));
        }
        seq.length.state = FieldState::Empty;
        encode_uint(buf, pmap, &mut seq.length)?;
        return Ok(());
    }
    if seq.elements.len() >= SEQUENCE_MAX_ELEMENTS {
        return Err(Error::Garbled("sequence too long"));
    }
    seq.length.set_uint(seq.elements.len() as u64);
    encode_uint(buf, pmap, &mut seq.length)?;
    field.state = FieldState::Assigned;

    let Sequence { row, elements, pmap_required, .. } = &mut **seq;
    for elem in elements.iter() {
        if *pmap_required {
            // The element map precedes the element body on the wire
            // but is only complete once the body is encoded, so the
            // body goes through a scratch buffer.
            let mut epmap = Pmap::for_encode();
            let mut scratch = Buffer::new(MESSAGE_MAX_SIZE);
            for (slot, staged) in row.iter_mut().zip(elem.iter()) {
                slot.adopt(staged)?;
                encode_field(&mut scratch, &mut epmap, slot)?;
            }
            epmap.emit(buf)?;
            buf.put_slice(scratch.slice())?;
        } else {
            let mut epmap = Pmap::empty();
            for (slot, staged) in row.iter_mut().zip(elem.iter()) {
                slot.adopt(staged)?;
                encode_field(buf, &mut epmap, slot)?;
            }
        }
    }
    Ok(())
}

/// Encode one field, dispatching on its wire type.
pub(crate) fn encode_field(buf: &mut Buffer, pmap: &mut Pmap, field: &mut Field) -> Result<()> {
    trace!("encode field {} ({:?}/{:?})", field.name, field.kind(), field.op);
    match field.kind() {
        Kind::Int => encode_int(buf, pmap, field),
        Kind::Uint => encode_uint(buf, pmap, field),
        Kind::Ascii => encode_ascii(buf, pmap, field),
        Kind::Unicode => encode_unicode(buf, pmap, field),
        Kind::Decimal => encode_decimal(buf, pmap, field),
        Kind::Sequence => encode_sequence(buf, pmap, field),
    }
}

/// Streaming FAST encoder: a template set plus the drive loop.
pub struct Encoder {
    templates: TemplateSet,
}

impl Encoder {
    /// Create an encoder owning `templates`.
    #[must_use]
    pub fn new(templates: TemplateSet) -> Self {
        Self { templates }
    }

    /// The owned template set.
    #[must_use]
    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// The owned template set, mutably.
    pub fn templates_mut(&mut self) -> &mut TemplateSet {
        &mut self.templates
    }

    /// The template for `tid`, for staging field values.
    pub fn template_mut(&mut self, tid: u32) -> Option<&mut Template> {
        self.templates.get_mut(tid)
    }

    /// Encode one message into two regions: the trimmed presence map
    /// in `pmap_buf` and the template id plus field bytes in `body`.
    ///
    /// Framing and transmission are the caller's business; see
    /// [`Encoder::send`] for the common case.
    pub fn encode(&mut self, tid: u32, pmap_buf: &mut Buffer, body: &mut Buffer) -> Result<()> {
        let Some(tmpl) = self.templates.get_mut(tid) else {
            return Err(Error::UnknownTemplate(u64::from(tid)));
        };
        debug!("encode message: template {} ({})", tmpl.tid, tmpl.name);
        let mut pmap = Pmap::for_encode();
        set_bit(&mut pmap, 0)?;
        stopbit::transfer_uint(body, u64::from(tid))?;
        for field in &mut tmpl.fields {
            encode_field(body, &mut pmap, field)?;
        }
        pmap.emit(pmap_buf)
    }

    /// Encode one message and gather-write `pmap ∥ body` to `w`.
    pub fn send<W: std::io::Write>(&mut self, tid: u32, w: &mut W) -> Result<()> {
        let mut pmap_buf = Buffer::new(PMAP_MAX_BYTES);
        let mut body = Buffer::new(MESSAGE_MAX_SIZE);
        self.encode(tid, &mut pmap_buf, &mut body)?;
        let mut written = w.write_vectored(&[
            std::io::IoSlice::new(pmap_buf.slice()),
            std::io::IoSlice::new(body.slice()),
        ])?;
        for region in [pmap_buf.slice(), body.slice()] {
            if written >= region.len() {
                written -= region.len();
            } else {
                w.write_all(&region[written..])?;
                written = 0;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::field::Decimal;
    use crate::template::{FieldDef, ResetDef, SequenceDef, TemplateDef};

    fn pair(defs: &[TemplateDef]) -> (Encoder, Decoder) {
        (
            Encoder::new(TemplateSet::new(defs).unwrap()),
            Decoder::new(TemplateSet::new(defs).unwrap()),
        )
    }

    fn one_field(def: FieldDef) -> Vec<TemplateDef> {
        vec![TemplateDef {
            tid: 1,
            name: "T".into(),
            fields: vec![def],
        }]
    }

    // Encode tid 1 and return (pmap bytes, body bytes).
    fn encode_one(e: &mut Encoder) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut pmap = Buffer::new(PMAP_MAX_BYTES);
        let mut body = Buffer::new(MESSAGE_MAX_SIZE);
        e.encode(1, &mut pmap, &mut body)?;
        Ok((pmap.slice().to_vec(), body.slice().to_vec()))
    }

    #[test]
    fn mandatory_uint_exact_bytes() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Uint));
        let (mut e, mut d) = pair(&defs);
        e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(300);
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(pmap, &[0xc0]);
        assert_eq!(body, &[0x81, 0x02, 0xac]);

        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        let msg = d.decode(&mut buf, 0)?;
        assert_eq!(msg.field("F").unwrap().uint(), Some(300));
        Ok(())
    }

    #[test]
    fn null_augmentation_law() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Uint).optional());
        let (mut e, mut d) = pair(&defs);
        e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(7);
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(body, &[0x81, 0x88]); // 7 travels as 8

        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        let f = d.decode(&mut buf, 0)?.field("F").unwrap();
        assert_eq!(f.uint(), Some(7));
        assert_eq!(f.state(), FieldState::Assigned);

        e.template_mut(1).unwrap().field_mut("F").unwrap().set_empty();
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(body, &[0x81, 0x80]); // empty travels as 0
        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        assert_eq!(
            d.decode(&mut buf, 0)?.field("F").unwrap().state(),
            FieldState::Empty
        );
        Ok(())
    }

    #[test]
    fn copy_idempotence() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Uint).with_operator(Operator::Copy));
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        for _ in 0..2 {
            e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(7);
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
        }
        // Second message carries no field bit and no field bytes.
        assert_eq!(&stream[3..], &[0xc0, 0x81]);

        let mut buf = Buffer::from_slice(&stream);
        for _ in 0..2 {
            assert_eq!(d.decode(&mut buf, 0)?.field("F").unwrap().uint(), Some(7));
        }
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn increment_idempotence() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Uint).with_operator(Operator::Increment));
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        for v in [100u64, 101, 102] {
            e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(v);
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
        }
        assert_eq!(stream, &[0xe0, 0x81, 0xe4, 0xc0, 0x81, 0xc0, 0x81]);

        let mut buf = Buffer::from_slice(&stream);
        for v in [100, 101, 102] {
            assert_eq!(d.decode(&mut buf, 0)?.field("F").unwrap().uint(), Some(v));
        }
        Ok(())
    }

    #[test]
    fn copy_reemits_after_change() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Uint).with_operator(Operator::Copy));
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        for v in [7u64, 7, 9] {
            e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(v);
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
        }
        let mut buf = Buffer::from_slice(&stream);
        for v in [7, 7, 9] {
            assert_eq!(d.decode(&mut buf, 0)?.field("F").unwrap().uint(), Some(v));
        }
        Ok(())
    }

    #[test]
    fn delta_int_round_trip() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Int).with_operator(Operator::Delta));
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        for v in [1000i64, 990, -5, -5] {
            e.template_mut(1).unwrap().field_mut("F").unwrap().set_int(v);
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
        }
        let mut buf = Buffer::from_slice(&stream);
        for v in [1000, 990, -5, -5] {
            assert_eq!(d.decode(&mut buf, 0)?.field("F").unwrap().int(), Some(v));
        }
        Ok(())
    }

    #[test]
    fn optional_decimal_delta_round_trip() -> Result<()> {
        let defs = one_field(
            FieldDef::new("Px", Kind::Decimal)
                .with_operator(Operator::Delta)
                .optional(),
        );
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        let values = [
            Decimal { exp: -2, mnt: 12345 },
            Decimal { exp: -2, mnt: 12400 },
            Decimal { exp: 1, mnt: 4 },
        ];
        for v in values {
            e.template_mut(1).unwrap().field_mut("Px").unwrap().set_decimal(v);
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
        }
        let mut buf = Buffer::from_slice(&stream);
        for v in values {
            assert_eq!(d.decode(&mut buf, 0)?.field("Px").unwrap().decimal(), Some(v));
        }
        Ok(())
    }

    #[test]
    fn ascii_copy_round_trip() -> Result<()> {
        let defs = one_field(FieldDef::new("Sym", Kind::Ascii).with_operator(Operator::Copy));
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        for v in [&b"MSFT"[..], b"MSFT", b"AAPL"] {
            e.template_mut(1).unwrap().field_mut("Sym").unwrap().set_ascii(v);
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
        }
        let mut buf = Buffer::from_slice(&stream);
        for v in [&b"MSFT"[..], b"MSFT", b"AAPL"] {
            assert_eq!(d.decode(&mut buf, 0)?.field("Sym").unwrap().ascii(), Some(v));
        }
        Ok(())
    }

    #[test]
    fn unicode_round_trip() -> Result<()> {
        let defs = one_field(FieldDef::new("Note", Kind::Unicode).optional());
        let (mut e, mut d) = pair(&defs);
        let mut stream = Vec::new();
        e.template_mut(1)
            .unwrap()
            .field_mut("Note")
            .unwrap()
            .set_unicode("héllo".as_bytes());
        let (pmap, body) = encode_one(&mut e)?;
        stream.extend_from_slice(&pmap);
        stream.extend_from_slice(&body);
        e.template_mut(1).unwrap().field_mut("Note").unwrap().set_empty();
        let (pmap, body) = encode_one(&mut e)?;
        stream.extend_from_slice(&pmap);
        stream.extend_from_slice(&body);

        let mut buf = Buffer::from_slice(&stream);
        assert_eq!(
            d.decode(&mut buf, 0)?.field("Note").unwrap().unicode(),
            Some("héllo".as_bytes())
        );
        assert_eq!(
            d.decode(&mut buf, 0)?.field("Note").unwrap().state(),
            FieldState::Empty
        );
        Ok(())
    }

    #[test]
    fn constant_encodes_nothing() -> Result<()> {
        let defs = vec![TemplateDef {
            tid: 1,
            name: "T".into(),
            fields: vec![
                FieldDef::new("M", Kind::Uint)
                    .with_operator(Operator::Constant)
                    .with_reset(ResetDef::Uint(9)),
                FieldDef::new("O", Kind::Ascii)
                    .with_operator(Operator::Constant)
                    .with_reset(ResetDef::Ascii("X".into()))
                    .optional(),
            ],
        }];
        let (mut e, mut d) = pair(&defs);
        e.template_mut(1).unwrap().field_mut("O").unwrap().set_ascii(b"X");
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(pmap, &[0xe0]); // tid bit + optional-constant bit
        assert_eq!(body, &[0x81]); // just the tid

        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        let msg = d.decode(&mut buf, 0)?;
        assert_eq!(msg.field("M").unwrap().uint(), Some(9));
        assert_eq!(msg.field("O").unwrap().ascii(), Some(&b"X"[..]));

        // Absent optional constant: bit clear, decodes empty.
        e.template_mut(1).unwrap().field_mut("O").unwrap().set_empty();
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(pmap, &[0xc0]);
        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        assert_eq!(
            d.decode(&mut buf, 0)?.field("O").unwrap().state(),
            FieldState::Empty
        );
        Ok(())
    }

    fn book_defs(element_pmap: bool) -> Vec<TemplateDef> {
        let element = if element_pmap {
            vec![
                FieldDef::new("Px", Kind::Uint).with_operator(Operator::Copy),
                FieldDef::new("Qty", Kind::Uint),
            ]
        } else {
            vec![
                FieldDef::new("Px", Kind::Uint),
                FieldDef::new("Qty", Kind::Uint),
            ]
        };
        vec![TemplateDef {
            tid: 1,
            name: "Book".into(),
            fields: vec![FieldDef::new("Entries", Kind::Sequence).with_sequence(
                SequenceDef {
                    length: Box::new(FieldDef::new("NoEntries", Kind::Uint)),
                    element,
                    element_pmap,
                },
            )],
        }]
    }

    fn stage_book(e: &mut Encoder, rows: &[(u64, u64)]) {
        let seq = e
            .template_mut(1)
            .unwrap()
            .field_mut("Entries")
            .unwrap()
            .sequence_mut()
            .unwrap();
        seq.clear();
        for &(px, qty) in rows {
            let elem = seq.push_element();
            elem[0].set_uint(px);
            elem[1].set_uint(qty);
        }
    }

    #[test]
    fn sequence_round_trip() -> Result<()> {
        for element_pmap in [false, true] {
            let defs = book_defs(element_pmap);
            let (mut e, mut d) = pair(&defs);
            stage_book(&mut e, &[(101, 5), (101, 7), (99, 2)]);
            let (pmap, body) = encode_one(&mut e)?;

            let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
            let msg = d.decode(&mut buf, 0)?;
            let seq = msg.field("Entries").unwrap().sequence().unwrap();
            assert_eq!(seq.len(), 3);
            for (i, &(px, qty)) in [(101, 5), (101, 7), (99, 2)].iter().enumerate() {
                assert_eq!(seq.elements()[i][0].uint(), Some(px), "pmap={element_pmap}");
                assert_eq!(seq.elements()[i][1].uint(), Some(qty));
            }
            assert!(buf.is_empty());
        }
        Ok(())
    }

    #[test]
    fn sequence_element_copy_saves_bytes() -> Result<()> {
        let defs = book_defs(true);
        let (mut e, _) = pair(&defs);
        stage_book(&mut e, &[(101, 5), (101, 7)]);
        let (_, body) = encode_one(&mut e)?;
        // tid, length, epmap+px+qty, epmap+qty (px copied).
        assert_eq!(body, &[0x81, 0x82, 0xc0, 0xe5, 0x85, 0x80, 0x87]);
        Ok(())
    }

    #[test]
    fn mandatory_empty_copy_fails() {
        let defs = one_field(FieldDef::new("F", Kind::Uint).with_operator(Operator::Copy));
        let mut e = Encoder::new(TemplateSet::new(&defs).unwrap());
        e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(1);
        e.template_mut(1).unwrap().field_mut("F").unwrap().set_empty();
        let mut pmap = Buffer::new(PMAP_MAX_BYTES);
        let mut body = Buffer::new(MESSAGE_MAX_SIZE);
        assert!(matches!(
            e.encode(1, &mut pmap, &mut body),
            Err(Error::Garbled(_))
        ));
    }

    #[test]
    fn encode_overflow() {
        let defs = one_field(FieldDef::new("F", Kind::Uint));
        let mut e = Encoder::new(TemplateSet::new(&defs).unwrap());
        e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(1 << 30);
        let mut pmap = Buffer::new(PMAP_MAX_BYTES);
        let mut body = Buffer::new(2);
        assert!(matches!(
            e.encode(1, &mut pmap, &mut body),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn send_gathers_pmap_and_body() -> Result<()> {
        let defs = one_field(FieldDef::new("F", Kind::Uint));
        let (mut e, mut d) = pair(&defs);
        let mut wire = Vec::new();
        e.template_mut(1).unwrap().field_mut("F").unwrap().set_uint(300);
        e.send(1, &mut wire)?;
        assert_eq!(wire, &[0xc0, 0x81, 0x02, 0xac]);
        let msg = d.decode(&mut Buffer::from_slice(&wire), 0)?;
        assert_eq!(msg.field("F").unwrap().uint(), Some(300));
        Ok(())
    }

    #[test]
    fn wide_pmap_round_trip() -> Result<()> {
        // Ten COPY fields claim bits 1..=10, spilling into a second
        // presence-map byte.
        let fields: Vec<FieldDef> = (0..10)
            .map(|i| FieldDef::new(&format!("F{i}"), Kind::Uint).with_operator(Operator::Copy))
            .collect();
        let defs = vec![TemplateDef {
            tid: 1,
            name: "Wide".into(),
            fields,
        }];
        let (mut e, mut d) = pair(&defs);
        for i in 0..10 {
            e.template_mut(1)
                .unwrap()
                .field_mut(&format!("F{i}"))
                .unwrap()
                .set_uint(i);
        }
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(pmap.len(), 2);
        assert_ne!(pmap[1] & 0x80, 0);
        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        let msg = d.decode(&mut buf, 0)?;
        for i in 0..10 {
            assert_eq!(msg.field(&format!("F{i}")).unwrap().uint(), Some(i));
        }

        // Change only the last field: its bit lives in byte 1, and the
        // leading zero byte must survive the trim.
        e.template_mut(1).unwrap().field_mut("F9").unwrap().set_uint(99);
        let (pmap, body) = encode_one(&mut e)?;
        assert_eq!(pmap, &[0x40, 0x88]);
        let mut buf = Buffer::from_slice(&[&pmap[..], &body[..]].concat());
        let msg = d.decode(&mut buf, 0)?;
        assert_eq!(msg.field("F8").unwrap().uint(), Some(8));
        assert_eq!(msg.field("F9").unwrap().uint(), Some(99));
        Ok(())
    }

    #[test]
    fn random_round_trip() -> Result<()> {
        use rand::Rng;
        let defs = vec![TemplateDef {
            tid: 1,
            name: "T".into(),
            fields: vec![
                FieldDef::new("A", Kind::Uint).with_operator(Operator::Copy),
                FieldDef::new("B", Kind::Int).with_operator(Operator::Delta),
                FieldDef::new("C", Kind::Uint)
                    .with_operator(Operator::Increment)
                    .optional(),
            ],
        }];
        let (mut e, mut d) = pair(&defs);
        let mut rng = rand::rng();
        let mut stream = Vec::new();
        let mut want = Vec::new();
        for _ in 0..200 {
            let a = rng.random_range(0..50u64);
            let b = rng.random_range(-1000..1000i64);
            let c = if rng.random_bool(0.2) {
                None
            } else {
                Some(rng.random_range(0..10u64))
            };
            let t = e.template_mut(1).unwrap();
            t.field_mut("A").unwrap().set_uint(a);
            t.field_mut("B").unwrap().set_int(b);
            match c {
                Some(v) => t.field_mut("C").unwrap().set_uint(v),
                None => t.field_mut("C").unwrap().set_empty(),
            }
            let (pmap, body) = encode_one(&mut e)?;
            stream.extend_from_slice(&pmap);
            stream.extend_from_slice(&body);
            want.push((a, b, c));
        }
        let mut buf = Buffer::from_slice(&stream);
        for (a, b, c) in want {
            let msg = d.decode(&mut buf, 0)?;
            assert_eq!(msg.field("A").unwrap().uint(), Some(a));
            assert_eq!(msg.field("B").unwrap().int(), Some(b));
            assert_eq!(msg.field("C").unwrap().uint(), c);
        }
        assert!(buf.is_empty());
        Ok(())
    }
}
