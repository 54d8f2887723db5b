//! Deoptimization metadata.
//!
//! A `ScheduledDeopt` tail-calls into the runtime with a metadata blob
//! describing every interpreter frame to reconstruct. The blob is built at
//! compile time, serialized into the fixed wire format below, and kept
//! alive by the compiled-code artifact; the generated code only embeds its
//! address.
//!
//! Wire format, all fields 4-byte integers in host byte order:
//!
//! ```text
//! num_frames
//! frames[num_frames] = { code_uid, pc_offset, stack_size, in_promise }
//! ```
//!
//! Frames are stored in stack order (innermost first), which is the
//! reverse of PIR argument order.

use fern_pir::FrameInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptMetadata {
    pub frames: Vec<FrameInfo>,
}

impl DeoptMetadata {
    /// Build from frames in PIR argument order, reversing to stack order.
    pub fn from_pir_frames(frames: &[FrameInfo]) -> Self {
        DeoptMetadata {
            frames: frames.iter().rev().copied().collect(),
        }
    }

    pub fn num_frames(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn serialize(&self) -> Box<[u8]> {
        let mut out = Vec::with_capacity(4 + self.frames.len() * 16);
        out.extend_from_slice(&self.num_frames().to_ne_bytes());
        for f in &self.frames {
            out.extend_from_slice(&f.code_uid.to_ne_bytes());
            out.extend_from_slice(&f.pc_offset.to_ne_bytes());
            out.extend_from_slice(&f.stack_size.to_ne_bytes());
            out.extend_from_slice(&(f.in_promise as u32).to_ne_bytes());
        }
        out.into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reverse_to_stack_order() {
        let outer = FrameInfo {
            code_uid: 1,
            pc_offset: 10,
            stack_size: 2,
            in_promise: false,
        };
        let inner = FrameInfo {
            code_uid: 2,
            pc_offset: 20,
            stack_size: 0,
            in_promise: true,
        };
        let m = DeoptMetadata::from_pir_frames(&[outer, inner]);
        assert_eq!(m.frames, vec![inner, outer]);
    }

    #[test]
    fn wire_format_is_packed_u32s() {
        let m = DeoptMetadata {
            frames: vec![FrameInfo {
                code_uid: 7,
                pc_offset: 3,
                stack_size: 1,
                in_promise: true,
            }],
        };
        let bytes = m.serialize();
        assert_eq!(bytes.len(), 4 + 16);
        assert_eq!(&bytes[0..4], &1u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_ne_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_ne_bytes());
    }
}
