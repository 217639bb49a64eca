#![warn(missing_docs)]
/*! This crate implements the FAST (FIX Adapted for STreaming) wire
codec used by market data feeds.

FAST is a stateful, template-driven compression protocol for FIX-style
messages. Every field in a template declares an operator (none, copy,
increment, delta, constant) whose behavior depends on per-field state
carried across messages, and on a per-message *presence map* of bits
that decide whether the next field is physically on the wire or
reconstructed from prior state.

# Architecture overview

A decoder drives the byte stream through a fixed pipeline:

```text
  [ Buffer (refillable byte window) ]
           ↓
      [ Presence map ]
           ↓
   [ Template lookup by id ]
           ↓
  [ Per-field operator engine ]
           ↓
     [ Decoded message ]
```

Encoding runs the pipeline backwards: each field's operator decides
whether to emit bytes and whether to flag a presence-map bit, and the
trimmed map is prepended to the body with a gather write.

Templates are plain data ([`template::TemplateDef`]) and can be loaded
from JSON. Each [`decode::Decoder`] or [`encode::Encoder`] owns its own
mutable template instances, because the cross-message field state is
the whole point of the protocol: two connections must never share it.

# Examples

Decode one message holding a single mandatory unsigned integer:

```
use fastwire::buffer::Buffer;
use fastwire::decode::Decoder;
use fastwire::field::Kind;
use fastwire::template::{FieldDef, TemplateDef, TemplateSet};

let defs = [TemplateDef {
    tid: 1,
    name: "Heartbeat".into(),
    fields: vec![FieldDef::new("SeqNum", Kind::Uint)],
}];
let mut decoder = Decoder::new(TemplateSet::new(&defs)?);

// pmap (template id present) || tid 1 || 300
let mut buf = Buffer::from_slice(&[0xC0, 0x81, 0x02, 0xAC]);
let msg = decoder.decode(&mut buf, 0)?;
assert_eq!(msg.field("SeqNum").unwrap().uint(), Some(300));
# Ok::<(), fastwire::Error>(())
```

## Links

* FAST specification: <https://www.fixtrading.org/standards/fast/>
 */

pub mod buffer;
pub mod decode;
pub mod encode;
pub mod field;
pub mod pmap;
pub mod stopbit;
pub mod template;

/// Errors returned by the codec.
///
/// Everything the wire can do wrong is terminal for the current
/// message; there are no partial results. Field state mutated before
/// the failure is left in place, so a caller that wants to continue on
/// the same stream should either resynchronize at an outer frame
/// boundary or [`template::Template::reset`] the affected template.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream violated wire syntax, or ended mid-primitive
    /// with the refill source exhausted.
    #[error("garbled stream: {0}")]
    Garbled(&'static str),

    /// A message referenced a template id that is not in the set.
    #[error("unknown template id {0}")]
    UnknownTemplate(u64),

    /// The output buffer ran out of space while encoding.
    #[error("output buffer full")]
    Overflow,

    /// A template definition was rejected while building the set.
    #[error("bad template definition: {0}")]
    BadTemplate(String),

    /// I/O error from a refill source or a send sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Template JSON could not be parsed.
    #[error("template config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
