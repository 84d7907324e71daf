//! Length-prefixed binary framing
//!
//! Each frame starts with a fixed header holding an unsigned length field and
//! optionally a type discriminator. The length counts the body bytes that
//! follow the header unless `length_includes_header` is set.
//!
//! A zero or oversized length cannot be resynchronised from, so the
//! direction is frozen at the first one and nothing after it is framed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DeframeContext, DeframeOutput, Frame};
use crate::error::{FlowError, FramingError};
use crate::message::MessageKind;
use crate::stream::StreamView;

/// Default ceiling on a declared frame length (16 MiB)
pub const DEFAULT_MAX_LENGTH: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Read an unsigned integer of up to 8 bytes
    pub fn read(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match self {
            Endian::Big => bytes.iter().fold(0, fold),
            Endian::Little => bytes.iter().rev().fold(0, fold),
        }
    }
}

/// Position of the type discriminator within the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeField {
    pub offset: usize,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthPrefixConfig {
    /// Offset of the length field within the header
    pub length_offset: usize,
    /// Width of the length field in bytes (1..=8)
    pub length_width: usize,
    pub endian: Endian,
    pub type_field: Option<TypeField>,
    /// Largest declared length accepted
    pub max_length: u64,
    pub length_includes_header: bool,
}

impl Default for LengthPrefixConfig {
    fn default() -> Self {
        Self {
            length_offset: 0,
            length_width: 2,
            endian: Endian::Little,
            type_field: None,
            max_length: DEFAULT_MAX_LENGTH,
            length_includes_header: false,
        }
    }
}

impl LengthPrefixConfig {
    pub fn validate(&self) -> Result<(), FramingError> {
        if !(1..=8).contains(&self.length_width) {
            return Err(FramingError::InvalidConfig(format!(
                "length_width must be 1..=8, got {}",
                self.length_width
            )));
        }
        if let Some(tf) = &self.type_field {
            if !(1..=8).contains(&tf.width) {
                return Err(FramingError::InvalidConfig(format!(
                    "type_field.width must be 1..=8, got {}",
                    tf.width
                )));
            }
        }
        if self.max_length == 0 {
            return Err(FramingError::InvalidConfig("max_length must be non-zero".into()));
        }
        Ok(())
    }

    /// Bytes needed before the length and type fields can be read
    pub fn header_len(&self) -> usize {
        let length_end = self.length_offset.saturating_add(self.length_width);
        let type_end = self
            .type_field
            .map(|tf| tf.offset.saturating_add(tf.width))
            .unwrap_or(0);
        length_end.max(type_end)
    }
}

#[derive(Debug)]
pub struct LengthPrefixedDeframer {
    config: LengthPrefixConfig,
    cursor: usize,
    frozen: Option<FramingError>,
}

impl LengthPrefixedDeframer {
    pub fn new(config: LengthPrefixConfig) -> Self {
        Self {
            config,
            cursor: 0,
            frozen: None,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn frozen(&self) -> Option<&FramingError> {
        self.frozen.as_ref()
    }

    /// Whole frame length, header included, for a declared length
    fn frame_len(&self, declared: u64) -> Result<usize, FramingError> {
        let offset = self.cursor;
        let header_len = self.config.header_len();
        if declared == 0 {
            return Err(FramingError::ZeroLength { offset });
        }
        if declared > self.config.max_length {
            return Err(FramingError::LengthExceedsCeiling {
                offset,
                declared,
                max: self.config.max_length,
            });
        }
        let unaddressable = FramingError::LengthExceedsCeiling {
            offset,
            declared,
            max: self.config.max_length,
        };
        let Ok(len) = usize::try_from(declared) else {
            return Err(unaddressable);
        };
        let total = if self.config.length_includes_header {
            if len < header_len {
                return Err(FramingError::LengthBelowHeader {
                    offset,
                    declared,
                    header_len,
                });
            }
            len
        } else {
            header_len
                .checked_add(len)
                .ok_or_else(|| unaddressable.clone())?
        };
        // The frame must also end at an addressable stream offset
        match offset.checked_add(total) {
            Some(_) => Ok(total),
            None => Err(unaddressable),
        }
    }

    pub fn deframe(&mut self, view: StreamView<'_>, ctx: &mut DeframeContext<'_>) -> DeframeOutput {
        let mut out = DeframeOutput::default();
        let bytes = view.bytes;
        let header_len = self.config.header_len();

        while self.frozen.is_none() && self.cursor < bytes.len() {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let rest = &bytes[self.cursor..];

            if rest.len() < header_len {
                self.flush_partial(&mut out, view, ctx.final_pass);
                break;
            }

            let length_field =
                &rest[self.config.length_offset..self.config.length_offset + self.config.length_width];
            let declared = self.config.endian.read(length_field);

            let total = match self.frame_len(declared) {
                Ok(len) => len,
                Err(err) => {
                    debug!(
                        "Freezing {} framing at offset {}: {}",
                        ctx.direction, self.cursor, err
                    );
                    out.error = Some(FlowError::Framing(err.clone()));
                    self.frozen = Some(err);
                    break;
                }
            };

            if rest.len() < total {
                self.flush_partial(&mut out, view, ctx.final_pass);
                break;
            }

            let type_tag = self
                .config
                .type_field
                .map(|tf| self.config.endian.read(&rest[tf.offset..tf.offset + tf.width]));
            let end = self.cursor + total;
            out.frames.extend(Frame::with_payload(
                view,
                self.cursor..end,
                rest[header_len..total].to_vec(),
                MessageKind::Framed { type_tag },
            ));
            self.cursor = end;
        }

        out
    }

    /// On the final pass, emit the incomplete tail as one partial frame
    fn flush_partial(&mut self, out: &mut DeframeOutput, view: StreamView<'_>, final_pass: bool) {
        if !final_pass {
            return;
        }
        let end = view.len();
        out.frames
            .extend(Frame::cut(view, self.cursor..end, MessageKind::Partial));
        self.cursor = end;
    }
}
