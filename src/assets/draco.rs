//! Decoder for Draco mesh payloads referenced by `KHR_draco_mesh_compression`.
//!
//! Reads bitstream 2.x meshes written with the sequential method: plain or
//! entropy-coded connectivity, and attributes stored raw, as integers,
//! quantized floats or octahedral normals with difference prediction.
//! Edgebreaker connectivity is reported as unsupported.

const MAGIC: &[u8; 5] = b"DRACO";
const METADATA_FLAG: u16 = 0x8000;
const MESH_ENCODER: u8 = 1;
const SEQUENTIAL_METHOD: u8 = 0;
const EDGEBREAKER_METHOD: u8 = 1;

const PREDICTION_NONE: i8 = -2;
const TRANSFORM_WRAP: i8 = 1;
const TRANSFORM_OCTAHEDRON: i8 = 2;
const TRANSFORM_OCTAHEDRON_CANONICAL: i8 = 3;

const TAG_BIT_LENGTH: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DracoError {
    #[error("payload is not a Draco bitstream")]
    NotDraco,
    #[error("Draco bitstream {0}.{1} is not supported")]
    UnsupportedVersion(u8, u8),
    #[error("Draco payload is a point cloud, not a mesh")]
    PointCloud,
    #[error("Draco edgebreaker connectivity is not supported")]
    Edgebreaker,
    #[error("unknown Draco encoding method {0}")]
    UnknownMethod(u8),
    #[error("Draco payload ends early")]
    Truncated,
    #[error("malformed Draco payload: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Position,
    Normal,
    Color,
    TexCoord,
    Generic,
}

impl AttributeKind {
    fn from_u8(value: u8) -> Result<Self, DracoError> {
        Ok(match value {
            0 => Self::Position,
            1 => Self::Normal,
            2 => Self::Color,
            3 => Self::TexCoord,
            4 => Self::Generic,
            _ => return Err(DracoError::Malformed("attribute type")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
}

impl DataType {
    fn from_u8(value: u8) -> Result<Self, DracoError> {
        Ok(match value {
            1 => Self::I8,
            2 => Self::U8,
            3 => Self::I16,
            4 => Self::U16,
            5 => Self::I32,
            6 => Self::U32,
            7 => Self::I64,
            8 => Self::U64,
            9 => Self::F32,
            10 => Self::F64,
            11 => Self::Bool,
            _ => return Err(DracoError::Malformed("attribute data type")),
        })
    }

    fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Largest magnitude used to map normalized integers into [-1, 1] or [0, 1].
    fn normalization(self) -> f32 {
        match self {
            Self::I8 => i8::MAX as f32,
            Self::U8 => u8::MAX as f32,
            Self::I16 => i16::MAX as f32,
            Self::U16 => u16::MAX as f32,
            Self::I32 => i32::MAX as f32,
            Self::U32 => u32::MAX as f32,
            _ => 1.0,
        }
    }

    fn read(self, bytes: &[u8]) -> f32 {
        let mut wide = [0u8; 8];
        wide[..bytes.len()].copy_from_slice(bytes);
        match self {
            Self::I8 => bytes[0] as i8 as f32,
            Self::U8 | Self::Bool => bytes[0] as f32,
            Self::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::I64 => i64::from_le_bytes(wide) as f32,
            Self::U64 => u64::from_le_bytes(wide) as f32,
            Self::F64 => f64::from_le_bytes(wide) as f32,
        }
    }
}

/// One decoded attribute, flattened to floats, indexed by point.
#[derive(Debug, Clone)]
pub struct DracoAttribute {
    pub unique_id: u32,
    pub kind: AttributeKind,
    pub components: usize,
    pub values: Vec<f32>,
}

impl DracoAttribute {
    pub fn to_vec3(&self) -> Option<Vec<[f32; 3]>> {
        (self.components == 3).then(|| {
            self.values
                .chunks_exact(3)
                .map(|v| [v[0], v[1], v[2]])
                .collect()
        })
    }

    pub fn to_vec2(&self) -> Option<Vec<[f32; 2]>> {
        (self.components == 2).then(|| {
            self.values
                .chunks_exact(2)
                .map(|v| [v[0], v[1]])
                .collect()
        })
    }
}

#[derive(Debug, Clone)]
pub struct DracoMesh {
    pub num_points: usize,
    pub indices: Vec<u32>,
    pub attributes: Vec<DracoAttribute>,
}

impl DracoMesh {
    /// Looks an attribute up by the id glTF's extension object maps semantics to.
    pub fn attribute(&self, unique_id: u32) -> Option<&DracoAttribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.unique_id == unique_id)
    }
}

pub fn decode_mesh(bytes: &[u8]) -> Result<DracoMesh, DracoError> {
    let mut reader = Reader::new(bytes);
    if reader.bytes(MAGIC.len()).map_err(|_| DracoError::NotDraco)? != MAGIC {
        return Err(DracoError::NotDraco);
    }
    let major = reader.u8()?;
    let minor = reader.u8()?;
    if major != 2 || minor > 2 {
        return Err(DracoError::UnsupportedVersion(major, minor));
    }
    reader.version = (major, minor);
    let encoder = reader.u8()?;
    let method = reader.u8()?;
    let flags = reader.u16()?;
    if encoder != MESH_ENCODER {
        return Err(DracoError::PointCloud);
    }
    match method {
        SEQUENTIAL_METHOD => {}
        EDGEBREAKER_METHOD => return Err(DracoError::Edgebreaker),
        other => return Err(DracoError::UnknownMethod(other)),
    }
    if flags & METADATA_FLAG != 0 {
        skip_metadata(&mut reader)?;
    }

    let (num_points, indices) = decode_sequential_connectivity(&mut reader)?;
    let mut attributes = Vec::new();
    let decoder_count = reader.u8()?;
    let mut groups = Vec::with_capacity(decoder_count as usize);
    for _ in 0..decoder_count {
        groups.push(read_attribute_group(&mut reader)?);
    }
    for group in groups {
        attributes.extend(decode_attribute_group(&mut reader, group, num_points)?);
    }

    Ok(DracoMesh {
        num_points,
        indices,
        attributes,
    })
}

fn skip_metadata(reader: &mut Reader) -> Result<(), DracoError> {
    let attribute_metadata = reader.varint_u32()?;
    for _ in 0..attribute_metadata {
        reader.varint_u32()?;
        skip_metadata_tree(reader)?;
    }
    skip_metadata_tree(reader)
}

fn skip_metadata_tree(reader: &mut Reader) -> Result<(), DracoError> {
    // Each entry is whether the pending metadata block is preceded by its name.
    let mut pending = vec![false];
    while let Some(named) = pending.pop() {
        if named {
            let len = reader.u8()? as usize;
            reader.bytes(len)?;
        }
        for _ in 0..reader.varint_u32()? {
            let len = reader.u8()? as usize;
            reader.bytes(len)?;
            let size = reader.varint_u32()? as usize;
            if size == 0 {
                return Err(DracoError::Malformed("empty metadata entry"));
            }
            reader.bytes(size)?;
        }
        let children = reader.varint_u32()? as usize;
        if children > reader.remaining() {
            return Err(DracoError::Malformed("metadata child count"));
        }
        pending.extend(std::iter::repeat(true).take(children));
    }
    Ok(())
}

fn decode_sequential_connectivity(reader: &mut Reader) -> Result<(usize, Vec<u32>), DracoError> {
    let (num_faces, num_points) = if reader.at_least(2, 2) {
        (reader.varint_u32()?, reader.varint_u32()?)
    } else {
        (reader.u32()?, reader.u32()?)
    };
    let index_count = (num_faces as usize)
        .checked_mul(3)
        .filter(|count| *count <= u32::MAX as usize)
        .ok_or(DracoError::Malformed("face count"))?;
    let mut indices = Vec::with_capacity(index_count.min(reader.remaining()));
    match reader.u8()? {
        0 => {
            let encoded = decode_symbols(reader, index_count, 1)?;
            let mut last = 0i64;
            for value in encoded {
                let magnitude = i64::from(value >> 1);
                let delta = if value & 1 == 1 { -magnitude } else { magnitude };
                last += delta;
                indices.push(u32::try_from(last).map_err(|_| DracoError::Malformed("face index"))?);
            }
        }
        1 => {
            for _ in 0..index_count {
                let index = if num_points < 256 {
                    u32::from(reader.u8()?)
                } else if num_points < (1 << 16) {
                    u32::from(reader.u16()?)
                } else if num_points < (1 << 21) && reader.at_least(2, 2) {
                    reader.varint_u32()?
                } else {
                    reader.u32()?
                };
                indices.push(index);
            }
        }
        _ => return Err(DracoError::Malformed("connectivity method")),
    }
    if indices.iter().any(|index| *index >= num_points) {
        return Err(DracoError::Malformed("face index out of range"));
    }
    Ok((num_points as usize, indices))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueCoding {
    Raw,
    Integer,
    Quantized,
    Normal,
}

struct AttributeHeader {
    kind: AttributeKind,
    data_type: DataType,
    components: usize,
    normalized: bool,
    unique_id: u32,
    coding: ValueCoding,
}

fn read_attribute_group(reader: &mut Reader) -> Result<Vec<AttributeHeader>, DracoError> {
    let count = reader.varint_u32()? as usize;
    if count == 0 || count > reader.remaining() {
        return Err(DracoError::Malformed("attribute count"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = AttributeKind::from_u8(reader.u8()?)?;
        let data_type = DataType::from_u8(reader.u8()?)?;
        let components = reader.u8()? as usize;
        let normalized = reader.u8()? > 0;
        let unique_id = reader.varint_u32()?;
        if components == 0 {
            return Err(DracoError::Malformed("attribute without components"));
        }
        headers.push(AttributeHeader {
            kind,
            data_type,
            components,
            normalized,
            unique_id,
            coding: ValueCoding::Raw,
        });
    }
    for header in &mut headers {
        header.coding = match reader.u8()? {
            0 => ValueCoding::Raw,
            1 => ValueCoding::Integer,
            2 => ValueCoding::Quantized,
            3 => ValueCoding::Normal,
            _ => return Err(DracoError::Malformed("attribute decoder type")),
        };
        let float = header.data_type == DataType::F32;
        match header.coding {
            ValueCoding::Quantized if !float => {
                return Err(DracoError::Malformed("quantized attribute is not float"))
            }
            ValueCoding::Normal if !float || header.components != 3 => {
                return Err(DracoError::Malformed("normal attribute is not float3"))
            }
            _ => {}
        }
    }
    Ok(headers)
}

/// Per-attribute state between the value pass and the transform pass.
enum Portable {
    Floats(Vec<f32>),
    Ints(Vec<i32>),
}

fn decode_attribute_group(
    reader: &mut Reader,
    headers: Vec<AttributeHeader>,
    num_points: usize,
) -> Result<Vec<DracoAttribute>, DracoError> {
    // Values for every attribute come first, then every transform's parameters.
    let mut portable = Vec::with_capacity(headers.len());
    for header in &headers {
        portable.push(match header.coding {
            ValueCoding::Raw => {
                let stride = header.data_type.size() * header.components;
                let total = num_points
                    .checked_mul(stride)
                    .ok_or(DracoError::Malformed("attribute size"))?;
                let bytes = reader.bytes(total)?;
                Portable::Floats(
                    bytes
                        .chunks_exact(header.data_type.size())
                        .map(|chunk| header.data_type.read(chunk))
                        .collect(),
                )
            }
            ValueCoding::Normal => Portable::Ints(decode_integer_values(reader, header, num_points, 2)?),
            ValueCoding::Integer | ValueCoding::Quantized => Portable::Ints(decode_integer_values(
                reader,
                header,
                num_points,
                header.components,
            )?),
        });
    }

    let mut attributes = Vec::with_capacity(headers.len());
    for (header, values) in headers.into_iter().zip(portable) {
        let values = match (header.coding, values) {
            (_, Portable::Floats(values)) => values,
            (ValueCoding::Quantized, Portable::Ints(values)) => {
                let quantization = Quantization::read(reader, header.components)?;
                quantization.dequantize(&values)
            }
            (ValueCoding::Normal, Portable::Ints(values)) => {
                let bits = reader.u8()?;
                let octahedron = Octahedron::new(i32::from(bits))?;
                values
                    .chunks_exact(2)
                    .flat_map(|st| octahedron.to_unit_vector(st[0], st[1]))
                    .collect()
            }
            (_, Portable::Ints(values)) => {
                let scale = if header.normalized {
                    header.data_type.normalization()
                } else {
                    1.0
                };
                values.into_iter().map(|value| value as f32 / scale).collect()
            }
        };
        attributes.push(DracoAttribute {
            unique_id: header.unique_id,
            kind: header.kind,
            components: header.components,
            values,
        });
    }
    Ok(attributes)
}

enum Prediction {
    Wrap(Wrap),
    Octahedron { tools: Octahedron, canonical: bool },
}

fn decode_integer_values(
    reader: &mut Reader,
    header: &AttributeHeader,
    num_points: usize,
    components: usize,
) -> Result<Vec<i32>, DracoError> {
    let method = reader.i8()?;
    let transform = if method != PREDICTION_NONE {
        if !(-2..=6).contains(&method) {
            return Err(DracoError::Malformed("prediction method"));
        }
        let transform = reader.i8()?;
        let supported = match header.coding {
            ValueCoding::Normal => {
                transform == TRANSFORM_OCTAHEDRON || transform == TRANSFORM_OCTAHEDRON_CANONICAL
            }
            _ => transform == TRANSFORM_WRAP,
        };
        if !supported {
            return Err(DracoError::Malformed("prediction transform"));
        }
        Some(transform)
    } else {
        None
    };

    let count = num_points
        .checked_mul(components)
        .ok_or(DracoError::Malformed("attribute size"))?;
    let mut values: Vec<i32> = if reader.u8()? > 0 {
        decode_symbols(reader, count, components)?
            .into_iter()
            .map(|value| value as i32)
            .collect()
    } else {
        let width = reader.u8()? as usize;
        if width > 4 {
            return Err(DracoError::Malformed("integer width"));
        }
        if width == 0 {
            return Ok(vec![0; count]);
        }
        let bytes = reader.bytes(count.checked_mul(width).ok_or(DracoError::Truncated)?)?;
        bytes
            .chunks_exact(width)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..width].copy_from_slice(chunk);
                i32::from_le_bytes(word)
            })
            .collect()
    };

    // Octahedral corrections are stored unsigned; everything else is zigzagged.
    let positive = matches!(
        transform,
        Some(TRANSFORM_OCTAHEDRON) | Some(TRANSFORM_OCTAHEDRON_CANONICAL)
    );
    if !positive {
        for value in &mut values {
            *value = unzigzag(*value as u32);
        }
    }

    if let Some(transform) = transform {
        let prediction = match transform {
            TRANSFORM_WRAP => Prediction::Wrap(Wrap::read(reader)?),
            _ => {
                let max_quantized = reader.i32()?;
                if !reader.at_least(2, 2) {
                    // Older streams also carry the center value.
                    reader.i32()?;
                }
                Prediction::Octahedron {
                    tools: Octahedron::from_max_quantized(max_quantized)?,
                    canonical: transform == TRANSFORM_OCTAHEDRON_CANONICAL,
                }
            }
        };
        undo_difference(&mut values, components, &prediction);
    }
    Ok(values)
}

fn unzigzag(value: u32) -> i32 {
    let magnitude = (value >> 1) as i32;
    if value & 1 == 0 {
        magnitude
    } else {
        -magnitude - 1
    }
}

/// Each entry was stored as its difference from the previous one.
fn undo_difference(values: &mut [i32], components: usize, prediction: &Prediction) {
    let mut previous = vec![0i32; components];
    for entry in values.chunks_exact_mut(components) {
        match prediction {
            Prediction::Wrap(wrap) => wrap.apply(&previous, entry),
            Prediction::Octahedron { tools, canonical } => {
                let (s, t) = tools.correct(previous[0], previous[1], entry[0], entry[1], *canonical);
                entry[0] = s;
                entry[1] = t;
            }
        }
        previous.copy_from_slice(entry);
    }
}

struct Wrap {
    min: i32,
    max: i32,
    span: i32,
}

impl Wrap {
    fn read(reader: &mut Reader) -> Result<Self, DracoError> {
        let min = reader.i32()?;
        let max = reader.i32()?;
        let span = i64::from(max) - i64::from(min);
        if !(0..i64::from(i32::MAX)).contains(&span) {
            return Err(DracoError::Malformed("wrap bounds"));
        }
        Ok(Self {
            min,
            max,
            span: span as i32 + 1,
        })
    }

    fn apply(&self, predicted: &[i32], entry: &mut [i32]) {
        for (value, predicted) in entry.iter_mut().zip(predicted) {
            let predicted = (*predicted).clamp(self.min, self.max);
            let mut original = predicted.wrapping_add(*value);
            if original > self.max {
                original = original.wrapping_sub(self.span);
            } else if original < self.min {
                original = original.wrapping_add(self.span);
            }
            *value = original;
        }
    }
}

struct Quantization {
    min: Vec<f32>,
    step: f32,
}

impl Quantization {
    fn read(reader: &mut Reader, components: usize) -> Result<Self, DracoError> {
        let min = (0..components)
            .map(|_| reader.f32())
            .collect::<Result<Vec<_>, _>>()?;
        let range = reader.f32()?;
        let bits = reader.u8()?;
        if !(1..=30).contains(&bits) {
            return Err(DracoError::Malformed("quantization bits"));
        }
        let max_quantized = (1u32 << bits) - 1;
        Ok(Self {
            min,
            step: range / max_quantized as f32,
        })
    }

    fn dequantize(&self, values: &[i32]) -> Vec<f32> {
        values
            .chunks_exact(self.min.len())
            .flat_map(|entry| {
                entry
                    .iter()
                    .zip(&self.min)
                    .map(|(value, min)| *value as f32 * self.step + min)
            })
            .collect()
    }
}

/// Octahedral normal coordinates, as integers in `[0, max_quantized]`.
struct Octahedron {
    max_quantized: i32,
    center: i32,
    scale: f32,
}

impl Octahedron {
    fn new(bits: i32) -> Result<Self, DracoError> {
        if !(2..=30).contains(&bits) {
            return Err(DracoError::Malformed("normal quantization bits"));
        }
        let max_quantized = (1i32 << bits) - 1;
        let max_value = max_quantized - 1;
        Ok(Self {
            max_quantized,
            center: max_value / 2,
            scale: 2.0 / max_value as f32,
        })
    }

    fn from_max_quantized(max_quantized: i32) -> Result<Self, DracoError> {
        if max_quantized <= 0 || max_quantized % 2 == 0 {
            return Err(DracoError::Malformed("octahedron range"));
        }
        Self::new(32 - max_quantized.leading_zeros() as i32)
    }

    fn to_unit_vector(&self, s: i32, t: i32) -> [f32; 3] {
        let mut y = s as f32 * self.scale - 1.0;
        let mut z = t as f32 * self.scale - 1.0;
        let x = 1.0 - y.abs() - z.abs();
        let fold = (-x).max(0.0);
        y += if y < 0.0 { fold } else { -fold };
        z += if z < 0.0 { fold } else { -fold };
        let norm = (x * x + y * y + z * z).sqrt();
        if norm * norm < 1e-6 {
            [0.0; 3]
        } else {
            [x / norm, y / norm, z / norm]
        }
    }

    fn in_diamond(&self, s: i32, t: i32) -> bool {
        s.abs() + t.abs() <= self.center
    }

    fn invert_diamond(&self, s: &mut i32, t: &mut i32) {
        let (sign_s, sign_t) = if *s >= 0 && *t >= 0 {
            (1, 1)
        } else if *s <= 0 && *t <= 0 {
            (-1, -1)
        } else {
            (if *s > 0 { 1 } else { -1 }, if *t > 0 { 1 } else { -1 })
        };
        let corner_s = sign_s * self.center;
        let corner_t = sign_t * self.center;
        let mut us = 2 * *s - corner_s;
        let mut ut = 2 * *t - corner_t;
        if sign_s * sign_t >= 0 {
            let swapped = us;
            us = -ut;
            ut = -swapped;
        } else {
            std::mem::swap(&mut us, &mut ut);
        }
        *s = (us + corner_s) / 2;
        *t = (ut + corner_t) / 2;
    }

    fn mod_max(&self, x: i32) -> i32 {
        if x > self.center {
            x - self.max_quantized
        } else if x < -self.center {
            x + self.max_quantized
        } else {
            x
        }
    }

    fn correct(&self, pred_s: i32, pred_t: i32, corr_s: i32, corr_t: i32, canonical: bool) -> (i32, i32) {
        let (mut s, mut t) = (pred_s - self.center, pred_t - self.center);
        let in_diamond = self.in_diamond(s, t);
        if !in_diamond {
            self.invert_diamond(&mut s, &mut t);
        }
        let rotation = if canonical && !bottom_left(s, t) {
            let count = rotation_count(s, t);
            (s, t) = rotate(s, t, count);
            Some(count)
        } else {
            None
        };
        let mut os = self.mod_max(s + corr_s);
        let mut ot = self.mod_max(t + corr_t);
        if let Some(count) = rotation {
            (os, ot) = rotate(os, ot, (4 - count) % 4);
        }
        if !in_diamond {
            self.invert_diamond(&mut os, &mut ot);
        }
        (os + self.center, ot + self.center)
    }
}

fn bottom_left(s: i32, t: i32) -> bool {
    (s == 0 && t == 0) || (s < 0 && t <= 0)
}

fn rotation_count(s: i32, t: i32) -> u8 {
    match (s.signum(), t.signum()) {
        (0, 0) => 0,
        (0, 1) => 3,
        (0, _) => 1,
        (1, -1) => 1,
        (1, _) => 2,
        (_, 1) => 3,
        _ => 0,
    }
}

fn rotate(s: i32, t: i32, count: u8) -> (i32, i32) {
    match count {
        1 => (t, -s),
        2 => (-s, -t),
        3 => (-t, s),
        _ => (s, t),
    }
}

fn decode_symbols(reader: &mut Reader, count: usize, components: usize) -> Result<Vec<u32>, DracoError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    match reader.u8()? {
        0 => decode_tagged_symbols(reader, count, components),
        1 => {
            let bit_length = u32::from(reader.u8()?);
            if !(1..=18).contains(&bit_length) {
                return Err(DracoError::Malformed("symbol bit length"));
            }
            let mut decoder = RansSymbols::read(reader, bit_length)?;
            (0..count).map(|_| decoder.decode()).collect()
        }
        _ => Err(DracoError::Malformed("symbol coding")),
    }
}

/// Each group of components shares a bit length from the rANS stream; the
/// values themselves follow as plain bits.
fn decode_tagged_symbols(reader: &mut Reader, count: usize, components: usize) -> Result<Vec<u32>, DracoError> {
    let mut tags = RansSymbols::read(reader, TAG_BIT_LENGTH)?;
    let mut bits = BitReader::new(reader.rest());
    let mut values = Vec::with_capacity(count.min(reader.remaining() * 8));
    while values.len() < count {
        let width = tags.decode()?;
        if width > 32 {
            return Err(DracoError::Malformed("tagged symbol width"));
        }
        for _ in 0..components {
            values.push(bits.read(width));
        }
    }
    values.truncate(count);
    let consumed = bits.bytes_consumed();
    reader.bytes(consumed)?;
    Ok(values)
}

/// Table-driven rANS decoder over one symbol stream.
struct RansSymbols<'a> {
    precision: u32,
    lower_bound: u32,
    /// (probability, cumulative probability) per symbol.
    table: Vec<(u32, u32)>,
    lookup: Vec<u32>,
    data: &'a [u8],
    offset: usize,
    state: u32,
}

impl<'a> RansSymbols<'a> {
    fn read(reader: &mut Reader<'a>, bit_length: u32) -> Result<Self, DracoError> {
        let precision_bits = (3 * bit_length / 2).clamp(12, 20);
        let precision = 1u32 << precision_bits;

        let num_symbols = reader.varint_u32()? as usize;
        if num_symbols == 0 || num_symbols > reader.remaining() {
            return Err(DracoError::Malformed("symbol table size"));
        }
        let mut probabilities = vec![0u32; num_symbols];
        let mut i = 0;
        while i < num_symbols {
            let byte = reader.u8()?;
            let token = byte & 3;
            if token == 3 {
                let run = (byte >> 2) as usize;
                if i + run >= num_symbols {
                    return Err(DracoError::Malformed("symbol table run"));
                }
                i += run + 1;
                continue;
            }
            let mut probability = u32::from(byte >> 2);
            for extra in 0..u32::from(token) {
                probability |= u32::from(reader.u8()?) << (8 * (extra + 1) - 2);
            }
            probabilities[i] = probability;
            i += 1;
        }

        let mut table = Vec::with_capacity(num_symbols);
        let mut lookup = vec![0u32; precision as usize];
        let mut cumulative = 0u32;
        for (symbol, probability) in probabilities.into_iter().enumerate() {
            let start = cumulative;
            cumulative = cumulative
                .checked_add(probability)
                .filter(|sum| *sum <= precision)
                .ok_or(DracoError::Malformed("symbol probabilities"))?;
            lookup[start as usize..cumulative as usize].fill(symbol as u32);
            table.push((probability, start));
        }
        if cumulative != precision {
            return Err(DracoError::Malformed("symbol probabilities"));
        }

        let size = usize::try_from(reader.varint_u64()?).map_err(|_| DracoError::Truncated)?;
        let data = reader.bytes(size)?;
        let lower_bound = precision * 4;
        let (offset, state) = initial_state(data)?;
        let state = state + lower_bound;
        if u64::from(state) >= u64::from(lower_bound) * 256 {
            return Err(DracoError::Malformed("rANS state"));
        }
        Ok(Self {
            precision,
            lower_bound,
            table,
            lookup,
            data,
            offset,
            state,
        })
    }

    fn decode(&mut self) -> Result<u32, DracoError> {
        while self.state < self.lower_bound && self.offset > 0 {
            self.offset -= 1;
            self.state = self.state * 256 + u32::from(self.data[self.offset]);
        }
        let quotient = self.state / self.precision;
        let remainder = self.state % self.precision;
        let symbol = self.lookup[remainder as usize];
        let (probability, start) = self.table[symbol as usize];
        self.state = quotient * probability + remainder - start;
        Ok(symbol)
    }
}

/// The stream ends with the encoder's final state; its top two bits give its width.
fn initial_state(data: &[u8]) -> Result<(usize, u32), DracoError> {
    let Some(&last) = data.last() else {
        return Err(DracoError::Malformed("empty rANS stream"));
    };
    let width = (last >> 6) as usize + 1;
    if data.len() < width {
        return Err(DracoError::Truncated);
    }
    let offset = data.len() - width;
    let mut word = [0u8; 4];
    word[..width].copy_from_slice(&data[offset..]);
    let mask = (1u32 << (8 * width - 2)) - 1;
    Ok((offset, u32::from_le_bytes(word) & mask))
}

/// Least-significant-bit-first reader used by tagged symbols.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read(&mut self, width: u32) -> u32 {
        let mut value = 0u32;
        for shift in 0..width {
            let byte = self.data.get(self.bit >> 3).copied().unwrap_or(0);
            value |= u32::from((byte >> (self.bit & 7)) & 1) << shift;
            self.bit += 1;
        }
        value
    }

    fn bytes_consumed(&self) -> usize {
        self.bit.div_ceil(8).min(self.data.len())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    version: (u8, u8),
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            version: (2, 2),
        }
    }

    fn at_least(&self, major: u8, minor: u8) -> bool {
        self.version >= (major, minor)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DracoError> {
        let end = self.pos.checked_add(len).ok_or(DracoError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(DracoError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DracoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DracoError> {
        Ok(self.array::<1>()?[0])
    }

    fn i8(&mut self) -> Result<i8, DracoError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DracoError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DracoError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DracoError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, DracoError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn varint_u64(&mut self) -> Result<u64, DracoError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DracoError::Malformed("varint"))
    }

    fn varint_u32(&mut self) -> Result<u32, DracoError> {
        u32::try_from(self.varint_u64()?).map_err(|_| DracoError::Malformed("varint"))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{triangle, StreamWriter};
    use super::*;

    #[test]
    fn sequential_triangle_decodes() {
        let mesh = decode_mesh(&triangle()).unwrap();
        assert_eq!(mesh.num_points, 3);
        assert_eq!(mesh.indices, vec![0, 1, 2]);

        let positions = mesh.attribute(0).unwrap();
        assert_eq!(positions.kind, AttributeKind::Position);
        assert_eq!(
            positions.to_vec3().unwrap(),
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
        );
        let uvs = mesh.attribute(1).unwrap();
        assert_eq!(uvs.kind, AttributeKind::TexCoord);
        assert_eq!(uvs.to_vec2().unwrap(), vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        assert!(mesh.attribute(7).is_none());
    }

    #[test]
    fn raw_indices_and_integer_attribute() {
        let mut stream = StreamWriter::mesh(0);
        stream
            .u8s(&[1, 3, 1, 2, 0, 1])
            .u8s(&[1, 1])
            .u8s(&[4, 4, 1, 1, 5])
            .u8s(&[1])
            // no prediction, two-byte raw values 0, 65534, 32768 unzigzag to 0, 32767, 16384
            .u8s(&[0xfe, 0, 2])
            .u8s(&[0, 0, 0xfe, 0xff, 0, 0x80]);
        let mesh = decode_mesh(&stream.0).unwrap();
        assert_eq!(mesh.indices, vec![2, 0, 1]);
        let generic = mesh.attribute(5).unwrap();
        assert_eq!(generic.kind, AttributeKind::Generic);
        let expected = [0.0, 32767.0 / 65535.0, 16384.0 / 65535.0];
        for (value, expected) in generic.values.iter().zip(expected) {
            assert!((value - expected).abs() < 1e-6, "{value} != {expected}");
        }
    }

    #[test]
    fn tagged_indices_share_one_bit_width() {
        let mut stream = StreamWriter::mesh(0);
        stream
            .u8s(&[1, 3, 0])
            // tagged coding; every tag is width 2
            .u8s(&[0, 3, 0x07, 0x01, 0x40, 1, 0x00])
            // 0, 2, 2 packed two bits each, least significant first
            .u8s(&[0x28])
            .u8s(&[1, 1, 0, 9, 3, 0, 0, 0])
            .f32s(&[0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let mesh = decode_mesh(&stream.0).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(
            mesh.attribute(0).unwrap().to_vec3().unwrap(),
            vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 2.0, 0.0]]
        );
    }

    #[test]
    fn edgebreaker_and_point_clouds_are_rejected() {
        assert_eq!(
            decode_mesh(&StreamWriter::mesh(1).0).unwrap_err(),
            DracoError::Edgebreaker
        );
        let mut cloud = b"DRACO".to_vec();
        cloud.extend_from_slice(&[2, 2, 0, 0, 0, 0]);
        assert_eq!(decode_mesh(&cloud).unwrap_err(), DracoError::PointCloud);
        let mut old = b"DRACO".to_vec();
        old.extend_from_slice(&[1, 3, 1, 0, 0, 0]);
        assert_eq!(decode_mesh(&old).unwrap_err(), DracoError::UnsupportedVersion(1, 3));
        assert_eq!(decode_mesh(b"glTF").unwrap_err(), DracoError::NotDraco);
    }

    #[test]
    fn truncated_streams_fail_cleanly() {
        let full = triangle();
        for len in 11..full.len() {
            assert!(decode_mesh(&full[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn out_of_range_index_is_malformed() {
        let mut stream = StreamWriter::mesh(0);
        stream.u8s(&[1, 3, 1, 0, 1, 3]);
        assert_eq!(
            decode_mesh(&stream.0).unwrap_err(),
            DracoError::Malformed("face index out of range")
        );
    }

    #[test]
    fn metadata_block_is_skipped() {
        let mut with_metadata = StreamWriter::mesh(0);
        with_metadata.0[9] = 0;
        with_metadata.0[10] = 0x80;
        // no attribute metadata; one entry "k" = [7]; one child "c" with no entries
        with_metadata.u8s(&[0, 1, 1, b'k', 1, 7, 1, 1, b'c', 0, 0]);
        with_metadata.u8s(&triangle()[11..]);
        let mesh = decode_mesh(&with_metadata.0).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2]);
    }

    #[test]
    fn octahedral_center_is_the_x_axis() {
        let close = |a: [f32; 3], b: [f32; 3]| a.iter().zip(b).all(|(a, b)| (a - b).abs() < 1e-5);
        let octahedron = Octahedron::new(4).unwrap();
        assert!(close(octahedron.to_unit_vector(7, 7), [1.0, 0.0, 0.0]));
        assert!(close(octahedron.to_unit_vector(14, 7), [0.0, 1.0, 0.0]));
        assert!(close(octahedron.to_unit_vector(0, 0), [-1.0, 0.0, 0.0]));
    }

    #[test]
    fn octahedral_correction_inside_the_diamond_adds() {
        let octahedron = Octahedron::from_max_quantized(15).unwrap();
        assert_eq!(octahedron.correct(7, 7, 1, -2, false), (8, 5));
        assert_eq!(octahedron.correct(7, 7, 1, -2, true), (8, 5));
    }

    #[test]
    fn zigzag_alternates_sign() {
        assert_eq!(
            [0, 1, 2, 3, 4].map(unzigzag),
            [0, -1, 1, -2, 2]
        );
    }
}
