//! Framed messages exchanged between neighbouring pipeline stages.
//!
//! A frame is either a tensor (activations flowing downstream, gradients
//! flowing back upstream) or a small JSON control command. On the wire every
//! frame starts with big-endian `u32` header words; tensor payloads are raw
//! native-endian numbers so they can be cast in place on receive.

use std::io;

use half::f16;

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const KIND_CONTROL: Header = 0;
const KIND_ACTIVATION_F32: Header = 1;
const KIND_ACTIVATION_F16: Header = 2;
const KIND_GRADIENT_F32: Header = 3;
const KIND_GRADIENT_F16: Header = 4;

/// A dense row-major `f32` matrix tagged with its micro-batch index.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub tag: u32,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor from row-major `data`.
    ///
    /// # Panics
    /// Panics when `rows * cols` does not match `data.len()`.
    pub fn new(tag: u32, rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(rows * cols, data.len(), "tensor shape does not match data");
        Self {
            tag,
            rows,
            cols,
            data,
        }
    }
}

/// Commands a stage peer understands outside the tensor traffic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Identifies the sending stage when a link is established.
    Hello { stage: usize, stages: usize },
    /// Tells the peer that no further frames will arrive on this link.
    Halt,
}

/// The application layer message for a stage link.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(Command),
    Activation(Tensor),
    Gradient(Tensor),
}

/// Payload encoding for tensor frames.
///
/// `F16` halves activation traffic on the wire; values are restored to
/// `f32` on receive. Arithmetic everywhere else stays in `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireDtype {
    #[default]
    F32,
    F16,
}

impl Frame {
    /// The micro-batch tag of a tensor frame, `None` for control frames.
    #[inline]
    pub fn tag(&self) -> Option<u32> {
        match self {
            Frame::Activation(t) | Frame::Gradient(t) => Some(t.tag),
            Frame::Control(_) => None,
        }
    }

    /// A short name for log and error messages.
    #[inline]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Control(_) => "control",
            Frame::Activation(_) => "activation",
            Frame::Gradient(_) => "gradient",
        }
    }

    /// Appends the wire encoding of this frame to `buf`.
    ///
    /// # Arguments
    /// * `dtype` - The payload encoding for tensor frames.
    /// * `buf` - The scratch buffer holding everything that must be copied.
    ///
    /// # Returns
    /// The zero-copy payload tail, when the payload can be written straight
    /// from the frame's own storage.
    pub(crate) fn encode<'a>(&'a self, dtype: WireDtype, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Frame::Control(cmd) => {
                buf.extend_from_slice(&KIND_CONTROL.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Frame::Activation(t) => encode_tensor(KIND_ACTIVATION_F32, t, dtype, buf),
            Frame::Gradient(t) => encode_tensor(KIND_GRADIENT_F32, t, dtype, buf),
        }
    }

    /// Decodes one frame from a received body (everything after the outer
    /// length prefix).
    ///
    /// Tensor payloads are cast in place, so `body` must be 4-byte aligned.
    pub(crate) fn decode(body: &[u8]) -> io::Result<Self> {
        if body.len() < HEADER_SIZE {
            return too_small(body.len());
        }

        let (kind_buf, rest) = body.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            KIND_CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Frame::Control(cmd))
            }
            KIND_ACTIVATION_F32..=KIND_GRADIENT_F16 => {
                let tensor = decode_tensor(kind, rest)?;

                match kind {
                    KIND_ACTIVATION_F32 | KIND_ACTIVATION_F16 => Ok(Frame::Activation(tensor)),
                    _ => Ok(Frame::Gradient(tensor)),
                }
            }
            kind => bad_kind(kind),
        }
    }
}

fn encode_tensor<'a>(
    kind_f32: Header,
    t: &'a Tensor,
    dtype: WireDtype,
    buf: &mut Vec<u8>,
) -> Option<&'a [u8]> {
    let kind = match dtype {
        WireDtype::F32 => kind_f32,
        WireDtype::F16 => kind_f32 + 1,
    };

    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&t.tag.to_be_bytes());
    buf.extend_from_slice(&(t.rows as Header).to_be_bytes());
    buf.extend_from_slice(&(t.cols as Header).to_be_bytes());

    match dtype {
        WireDtype::F32 => Some(bytemuck::cast_slice(&t.data)),
        WireDtype::F16 => {
            buf.reserve(t.data.len() * size_of::<f16>());
            for v in &t.data {
                buf.extend_from_slice(&f16::from_f32(*v).to_ne_bytes());
            }
            None
        }
    }
}

fn decode_tensor(kind: Header, rest: &[u8]) -> io::Result<Tensor> {
    const META_SIZE: usize = 3 * HEADER_SIZE;

    if rest.len() < META_SIZE {
        return too_small(rest.len() + HEADER_SIZE);
    }

    let (meta, payload) = rest.split_at(META_SIZE);

    // SAFETY: The three ranges are exactly HEADER_SIZE bytes each.
    let tag = Header::from_be_bytes(meta[0..4].try_into().unwrap());
    let rows = Header::from_be_bytes(meta[4..8].try_into().unwrap()) as usize;
    let cols = Header::from_be_bytes(meta[8..12].try_into().unwrap()) as usize;

    let data: Vec<f32> = match kind {
        KIND_ACTIVATION_F32 | KIND_GRADIENT_F32 => {
            let nums: &[f32] = bytemuck::try_cast_slice(payload).map_err(invalid_payload)?;
            nums.to_vec()
        }
        _ => {
            let nums: &[f16] = bytemuck::try_cast_slice(payload).map_err(invalid_payload)?;
            nums.iter().map(|h| h.to_f32()).collect()
        }
    };

    if data.len() != rows * cols {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "tensor payload holds {} values, header claims {rows}x{cols}",
                data.len()
            ),
        ));
    }

    Ok(Tensor {
        tag,
        rows,
        cols,
        data,
    })
}

fn too_small<T>(size: usize) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame body of {size} bytes is too short for its header"),
    ))
}

fn bad_kind<T>(kind: Header) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("received an invalid kind word {kind}"),
    ))
}

fn invalid_payload(err: bytemuck::PodCastError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("bad tensor payload: {err}"))
}
