// ONNX: protobuf wire codec for model files
//
// ONNX files are Protocol Buffers messages. This module carries a minimal
// wire-format decoder (feeds the graph loader) and encoder (used to
// assemble graphs in code, e.g. test fixtures and conversion tools) for the
// subset of the schema a forward pass needs:
//
//   ModelProto -> GraphProto -> NodeProto / TensorProto / ValueInfoProto
//                            -> AttributeProto
//
// Unknown fields are skipped, so files written by newer exporters still
// load as long as the graph itself only uses what is modelled here.
//
// REFERENCE:
//   https://github.com/onnx/onnx/blob/main/onnx/onnx.proto
//   https://protobuf.dev/programming-guides/encoding/

use std::path::Path;

use marten_core::{DType, Error, Result};

/// IR version written by the encoder.
pub const IR_VERSION: i64 = 8;

/// Opset assumed when a model carries no import for the default domain.
pub const DEFAULT_OPSET: i64 = 13;

// TensorProto.DataType
pub const FLOAT: i32 = 1;
pub const UINT8: i32 = 2;
pub const INT8: i32 = 3;
pub const UINT16: i32 = 4;
pub const INT16: i32 = 5;
pub const INT32: i32 = 6;
pub const INT64: i32 = 7;
pub const BOOL: i32 = 9;
pub const FLOAT16: i32 = 10;
pub const DOUBLE: i32 = 11;
pub const UINT32: i32 = 12;
pub const UINT64: i32 = 13;
pub const BFLOAT16: i32 = 16;

// AttributeProto.AttributeType
const ATTR_FLOAT: u64 = 1;
const ATTR_INT: u64 = 2;
const ATTR_STRING: u64 = 3;
const ATTR_TENSOR: u64 = 4;
const ATTR_FLOATS: u64 = 6;
const ATTR_INTS: u64 = 7;
const ATTR_STRINGS: u64 = 8;

/// Logical dtype for an ONNX element type.
pub fn onnx_to_dtype(data_type: i32) -> Result<DType> {
    match data_type {
        FLOAT | DOUBLE | BFLOAT16 => Ok(DType::F32),
        FLOAT16 => Ok(DType::F16),
        INT8 | INT16 | UINT16 | INT32 | UINT32 => Ok(DType::I32),
        INT64 | UINT64 => Ok(DType::I64),
        UINT8 | BOOL => Ok(DType::U8),
        other => Err(Error::Decode(format!(
            "unsupported tensor data type {other}"
        ))),
    }
}

/// ONNX element type for a logical dtype.
pub fn dtype_to_onnx(dtype: DType) -> i32 {
    match dtype {
        DType::F16 => FLOAT16,
        DType::F32 => FLOAT,
        DType::I32 => INT32,
        DType::I64 => INT64,
        DType::U8 => UINT8,
    }
}

// Minimal protobuf encoder

/// Protobuf wire-format encoder: varint, length-delimited and fixed32.
#[derive(Default)]
struct PbEncoder {
    buf: Vec<u8>,
}

impl PbEncoder {
    fn new() -> Self {
        Self::default()
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;
            if val == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Field tag: `field_number << 3 | wire_type`.
    fn write_tag(&mut self, field: u32, wire_type: u32) {
        self.write_varint(((field as u64) << 3) | wire_type as u64);
    }

    fn write_varint_field(&mut self, field: u32, val: u64) {
        self.write_tag(field, 0);
        self.write_varint(val);
    }

    /// int64 fields are plain two's-complement varints (not zigzag).
    fn write_int64_field(&mut self, field: u32, val: i64) {
        self.write_varint_field(field, val as u64);
    }

    fn write_fixed32_field(&mut self, field: u32, val: f32) {
        self.write_tag(field, 5);
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    fn write_bytes_field(&mut self, field: u32, data: &[u8]) {
        self.write_tag(field, 2);
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    fn write_string_field(&mut self, field: u32, val: &str) {
        self.write_bytes_field(field, val.as_bytes());
    }

    fn write_message_field(&mut self, field: u32, encoder: PbEncoder) {
        self.write_bytes_field(field, &encoder.buf);
    }

    fn write_packed_int64(&mut self, field: u32, values: &[i64]) {
        if values.is_empty() {
            return;
        }
        let mut packed = PbEncoder::new();
        for &v in values {
            packed.write_varint(v as u64);
        }
        self.write_message_field(field, packed);
    }

    fn write_packed_f32(&mut self, field: u32, values: &[f32]) {
        if values.is_empty() {
            return;
        }
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes_field(field, &bytes);
    }
}

// Minimal protobuf decoder

/// Protobuf wire-format decoder over a borrowed buffer.
struct PbDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PbDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| Error::Decode("unexpected end of data".into()))?;
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::Decode("varint too long".into()));
            }
        }
        Ok(result)
    }

    fn read_tag(&mut self) -> Result<(u32, u32)> {
        let val = self.read_varint()?;
        Ok(((val >> 3) as u32, (val & 0x7) as u32))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Decode(format!(
                "field of {len} bytes exceeds remaining {}",
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Decode("invalid UTF-8 string".into()))
    }

    fn read_fixed32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_fixed64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    fn skip_field(&mut self, wire_type: u32) -> Result<()> {
        match wire_type {
            0 => {
                self.read_varint()?;
            }
            1 => {
                self.take(8)?;
            }
            2 => {
                self.read_bytes()?;
            }
            5 => {
                self.take(4)?;
            }
            _ => {
                return Err(Error::Decode(format!("unsupported wire type {wire_type}")));
            }
        }
        Ok(())
    }

    /// Repeated varint, either packed (wire type 2) or one element.
    fn read_varints_into(&mut self, wire_type: u32, out: &mut Vec<i64>) -> Result<()> {
        if wire_type == 2 {
            let mut sub = PbDecoder::new(self.read_bytes()?);
            while sub.remaining() > 0 {
                out.push(sub.read_varint()? as i64);
            }
        } else {
            out.push(self.read_varint()? as i64);
        }
        Ok(())
    }

    /// Repeated float, either packed or one fixed32 element.
    fn read_floats_into(&mut self, wire_type: u32, out: &mut Vec<f32>) -> Result<()> {
        if wire_type == 2 {
            let bytes = self.read_bytes()?;
            out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        } else {
            out.push(self.read_fixed32()?);
        }
        Ok(())
    }
}

// TensorProto

/// A named tensor: initializers and `Constant` attribute values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorProto {
    pub name: String,
    pub data_type: i32,
    pub dims: Vec<i64>,
    pub float_data: Vec<f32>,
    pub int32_data: Vec<i64>,
    pub int64_data: Vec<i64>,
    pub double_data: Vec<f64>,
    pub raw_data: Vec<u8>,
}

impl TensorProto {
    /// FLOAT tensor.
    pub fn from_f32(name: &str, dims: &[i64], data: &[f32]) -> Self {
        TensorProto {
            name: name.to_string(),
            data_type: FLOAT,
            dims: dims.to_vec(),
            float_data: data.to_vec(),
            ..Default::default()
        }
    }

    /// INT64 tensor, the usual carrier for shapes and axes.
    pub fn from_i64(name: &str, dims: &[i64], data: &[i64]) -> Self {
        TensorProto {
            name: name.to_string(),
            data_type: INT64,
            dims: dims.to_vec(),
            int64_data: data.to_vec(),
            ..Default::default()
        }
    }

    /// Element count implied by `dims`, or `None` if a dim is negative or
    /// the product overflows.
    pub fn shape_elem_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))
    }

    /// Element values widened to f32, whichever field carries them.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if !self.raw_data.is_empty() {
            return self.decode_raw();
        }
        Ok(match self.data_type {
            FLOAT => self.float_data.clone(),
            DOUBLE => self.double_data.iter().map(|&v| v as f32).collect(),
            INT64 | UINT64 => self.int64_data.iter().map(|&v| v as f32).collect(),
            // FLOAT16 and BFLOAT16 travel as bit patterns in int32_data
            FLOAT16 => self
                .int32_data
                .iter()
                .map(|&v| half::f16::from_bits(v as u16).to_f32())
                .collect(),
            BFLOAT16 => self
                .int32_data
                .iter()
                .map(|&v| half::bf16::from_bits(v as u16).to_f32())
                .collect(),
            _ => self.int32_data.iter().map(|&v| v as i32 as f32).collect(),
        })
    }

    fn decode_raw(&self) -> Result<Vec<f32>> {
        let raw = &self.raw_data;
        let width = match self.data_type {
            FLOAT | INT32 | UINT32 => 4,
            DOUBLE | INT64 | UINT64 => 8,
            FLOAT16 | BFLOAT16 | INT16 | UINT16 => 2,
            INT8 | UINT8 | BOOL => 1,
            other => {
                return Err(Error::Decode(format!(
                    "tensor '{}': unsupported data type {other}",
                    self.name
                )))
            }
        };
        if raw.len() % width != 0 {
            return Err(Error::MalformedShape {
                name: self.name.clone(),
                reason: format!("{} raw bytes is not a multiple of {width}", raw.len()),
            });
        }
        let out = raw.chunks_exact(width);
        Ok(match self.data_type {
            FLOAT => out
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            INT32 => out
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            UINT32 => out
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            DOUBLE => out
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b) as f32
                })
                .collect(),
            INT64 | UINT64 => out
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    i64::from_le_bytes(b) as f32
                })
                .collect(),
            FLOAT16 => out
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            BFLOAT16 => out
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            INT16 => out.map(|c| i16::from_le_bytes([c[0], c[1]]) as f32).collect(),
            UINT16 => out.map(|c| u16::from_le_bytes([c[0], c[1]]) as f32).collect(),
            INT8 => out.map(|c| c[0] as i8 as f32).collect(),
            _ => out.map(|c| c[0] as f32).collect(),
        })
    }

    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for &d in &self.dims {
            enc.write_int64_field(1, d);
        }
        enc.write_varint_field(2, self.data_type as u64);
        enc.write_packed_f32(4, &self.float_data);
        enc.write_packed_int64(5, &self.int32_data);
        enc.write_packed_int64(7, &self.int64_data);
        if !self.name.is_empty() {
            enc.write_string_field(8, &self.name);
        }
        if !self.raw_data.is_empty() {
            enc.write_bytes_field(9, &self.raw_data);
        }
        if !self.double_data.is_empty() {
            let bytes: Vec<u8> = self.double_data.iter().flat_map(|v| v.to_le_bytes()).collect();
            enc.write_bytes_field(10, &bytes);
        }
        enc
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = PbDecoder::new(data);
        let mut t = TensorProto::default();
        while dec.remaining() > 0 {
            let (field, wire_type) = dec.read_tag()?;
            match field {
                1 => dec.read_varints_into(wire_type, &mut t.dims)?,
                2 => t.data_type = dec.read_varint()? as i32,
                4 => dec.read_floats_into(wire_type, &mut t.float_data)?,
                5 => dec.read_varints_into(wire_type, &mut t.int32_data)?,
                7 => dec.read_varints_into(wire_type, &mut t.int64_data)?,
                8 if wire_type == 2 => t.name = dec.read_string()?,
                9 if wire_type == 2 => t.raw_data = dec.read_bytes()?.to_vec(),
                10 if wire_type == 2 => {
                    let mut sub = PbDecoder::new(dec.read_bytes()?);
                    while sub.remaining() > 0 {
                        t.double_data.push(sub.read_fixed64()?);
                    }
                }
                10 if wire_type == 1 => t.double_data.push(dec.read_fixed64()?),
                _ => dec.skip_field(wire_type)?,
            }
        }
        Ok(t)
    }
}

// AttributeProto

/// A node attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Tensor(TensorProto),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl Attribute {
    /// Type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Attribute::Float(_) => "float",
            Attribute::Int(_) => "int",
            Attribute::String(_) => "string",
            Attribute::Tensor(_) => "tensor",
            Attribute::Floats(_) => "floats",
            Attribute::Ints(_) => "ints",
            Attribute::Strings(_) => "strings",
        }
    }
}

fn encode_attribute(name: &str, val: &Attribute) -> PbEncoder {
    let mut enc = PbEncoder::new();
    enc.write_string_field(1, name);
    let ty = match val {
        Attribute::Float(f) => {
            enc.write_fixed32_field(2, *f);
            ATTR_FLOAT
        }
        Attribute::Int(i) => {
            enc.write_int64_field(3, *i);
            ATTR_INT
        }
        Attribute::String(s) => {
            enc.write_string_field(4, s);
            ATTR_STRING
        }
        Attribute::Tensor(t) => {
            enc.write_message_field(5, t.encode());
            ATTR_TENSOR
        }
        Attribute::Floats(fs) => {
            enc.write_packed_f32(7, fs);
            ATTR_FLOATS
        }
        Attribute::Ints(is) => {
            enc.write_packed_int64(8, is);
            ATTR_INTS
        }
        Attribute::Strings(ss) => {
            for s in ss {
                enc.write_string_field(9, s);
            }
            ATTR_STRINGS
        }
    };
    enc.write_varint_field(20, ty);
    enc
}

fn decode_attribute(data: &[u8]) -> Result<(String, Attribute)> {
    let mut dec = PbDecoder::new(data);
    let mut name = String::new();
    let mut ty: u64 = 0;
    let mut f = 0.0f32;
    let mut i = 0i64;
    let mut s = String::new();
    let mut t = None;
    let mut floats = Vec::new();
    let mut ints = Vec::new();
    let mut strings = Vec::new();
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match field {
            1 if wire_type == 2 => name = dec.read_string()?,
            2 if wire_type == 5 => f = dec.read_fixed32()?,
            3 if wire_type == 0 => i = dec.read_varint()? as i64,
            4 if wire_type == 2 => s = dec.read_string()?,
            5 if wire_type == 2 => t = Some(TensorProto::decode(dec.read_bytes()?)?),
            7 => dec.read_floats_into(wire_type, &mut floats)?,
            8 => dec.read_varints_into(wire_type, &mut ints)?,
            9 if wire_type == 2 => strings.push(dec.read_string()?),
            20 if wire_type == 0 => ty = dec.read_varint()?,
            _ => dec.skip_field(wire_type)?,
        }
    }
    let val = match ty {
        ATTR_FLOAT => Attribute::Float(f),
        ATTR_INT => Attribute::Int(i),
        ATTR_STRING => Attribute::String(s),
        ATTR_TENSOR => Attribute::Tensor(t.unwrap_or_default()),
        ATTR_FLOATS => Attribute::Floats(floats),
        ATTR_INTS => Attribute::Ints(ints),
        ATTR_STRINGS => Attribute::Strings(strings),
        other => {
            return Err(Error::Decode(format!(
                "attribute '{name}': unsupported type {other}"
            )))
        }
    };
    Ok((name, val))
}

// NodeProto

/// One operator invocation in the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeProto {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    /// Input port names; an empty name marks an absent optional input.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, Attribute)>,
}

impl NodeProto {
    pub fn new(op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        NodeProto {
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// A `Constant` node producing `value` on `output`.
    pub fn constant(output: &str, value: TensorProto) -> Self {
        Self::new("Constant", &[], &[output]).with_attr("value", Attribute::Tensor(value))
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_attr(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.push((name.to_string(), value));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for input in &self.inputs {
            enc.write_string_field(1, input);
        }
        for output in &self.outputs {
            enc.write_string_field(2, output);
        }
        if !self.name.is_empty() {
            enc.write_string_field(3, &self.name);
        }
        enc.write_string_field(4, &self.op_type);
        for (key, val) in &self.attributes {
            enc.write_message_field(5, encode_attribute(key, val));
        }
        if !self.domain.is_empty() {
            enc.write_string_field(7, &self.domain);
        }
        enc
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = PbDecoder::new(data);
        let mut node = NodeProto::default();
        while dec.remaining() > 0 {
            let (field, wire_type) = dec.read_tag()?;
            match (field, wire_type) {
                (1, 2) => node.inputs.push(dec.read_string()?),
                (2, 2) => node.outputs.push(dec.read_string()?),
                (3, 2) => node.name = dec.read_string()?,
                (4, 2) => node.op_type = dec.read_string()?,
                (5, 2) => node.attributes.push(decode_attribute(dec.read_bytes()?)?),
                (7, 2) => node.domain = dec.read_string()?,
                _ => dec.skip_field(wire_type)?,
            }
        }
        Ok(node)
    }
}

// ValueInfoProto

/// One axis of a declared input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum Dim {
    Value(i64),
    Param(String),
}

/// A declared graph input or output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<Dim>,
}

impl ValueInfo {
    /// FLOAT value with fixed dims.
    pub fn new(name: &str, dims: &[i64]) -> Self {
        ValueInfo {
            name: name.to_string(),
            elem_type: FLOAT,
            dims: dims.iter().map(|&d| Dim::Value(d)).collect(),
        }
    }

    fn encode(&self) -> PbEncoder {
        let mut shape = PbEncoder::new();
        for d in &self.dims {
            let mut dim = PbEncoder::new();
            match d {
                Dim::Value(v) => dim.write_int64_field(1, *v),
                Dim::Param(p) => dim.write_string_field(2, p),
            }
            shape.write_message_field(1, dim);
        }
        let mut tensor_type = PbEncoder::new();
        tensor_type.write_varint_field(1, self.elem_type as u64);
        tensor_type.write_message_field(2, shape);
        let mut type_proto = PbEncoder::new();
        type_proto.write_message_field(1, tensor_type);

        let mut vi = PbEncoder::new();
        vi.write_string_field(1, &self.name);
        vi.write_message_field(2, type_proto);
        vi
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut vi = ValueInfo::default();
        let mut dec = PbDecoder::new(data);
        while dec.remaining() > 0 {
            match dec.read_tag()? {
                (1, 2) => vi.name = dec.read_string()?,
                (2, 2) => {
                    let mut ty = PbDecoder::new(dec.read_bytes()?);
                    while ty.remaining() > 0 {
                        match ty.read_tag()? {
                            (1, 2) => vi.decode_tensor_type(ty.read_bytes()?)?,
                            (_, w) => ty.skip_field(w)?,
                        }
                    }
                }
                (_, w) => dec.skip_field(w)?,
            }
        }
        Ok(vi)
    }

    fn decode_tensor_type(&mut self, data: &[u8]) -> Result<()> {
        let mut dec = PbDecoder::new(data);
        while dec.remaining() > 0 {
            match dec.read_tag()? {
                (1, 0) => self.elem_type = dec.read_varint()? as i32,
                (2, 2) => {
                    let mut shape = PbDecoder::new(dec.read_bytes()?);
                    while shape.remaining() > 0 {
                        match shape.read_tag()? {
                            (1, 2) => {
                                let mut dim = PbDecoder::new(shape.read_bytes()?);
                                let mut value = Dim::Param(String::new());
                                while dim.remaining() > 0 {
                                    match dim.read_tag()? {
                                        (1, 0) => value = Dim::Value(dim.read_varint()? as i64),
                                        (2, 2) => value = Dim::Param(dim.read_string()?),
                                        (_, w) => dim.skip_field(w)?,
                                    }
                                }
                                self.dims.push(value);
                            }
                            (_, w) => shape.skip_field(w)?,
                        }
                    }
                }
                (_, w) => dec.skip_field(w)?,
            }
        }
        Ok(())
    }
}

// GraphProto

/// The computation graph: nodes in file order plus initializers and the
/// declared inputs and outputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphProto {
    pub name: String,
    pub nodes: Vec<NodeProto>,
    pub initializers: Vec<TensorProto>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl GraphProto {
    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for node in &self.nodes {
            enc.write_message_field(1, node.encode());
        }
        enc.write_string_field(2, &self.name);
        for init in &self.initializers {
            enc.write_message_field(5, init.encode());
        }
        for input in &self.inputs {
            enc.write_message_field(11, input.encode());
        }
        for output in &self.outputs {
            enc.write_message_field(12, output.encode());
        }
        enc
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = PbDecoder::new(data);
        let mut graph = GraphProto::default();
        while dec.remaining() > 0 {
            let (field, wire_type) = dec.read_tag()?;
            match (field, wire_type) {
                (1, 2) => graph.nodes.push(NodeProto::decode(dec.read_bytes()?)?),
                (2, 2) => graph.name = dec.read_string()?,
                (5, 2) => graph
                    .initializers
                    .push(TensorProto::decode(dec.read_bytes()?)?),
                (11, 2) => graph.inputs.push(ValueInfo::decode(dec.read_bytes()?)?),
                (12, 2) => graph.outputs.push(ValueInfo::decode(dec.read_bytes()?)?),
                _ => dec.skip_field(wire_type)?,
            }
        }
        Ok(graph)
    }
}

// ModelProto

/// Operator set import: `domain` "" (or "ai.onnx") is the default domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorSetId {
    pub domain: String,
    pub version: i64,
}

/// A decoded ONNX model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelProto {
    pub ir_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub opset_import: Vec<OperatorSetId>,
    pub graph: GraphProto,
}

impl ModelProto {
    /// Empty model importing the default domain at `opset`.
    pub fn new(opset: i64) -> Self {
        ModelProto {
            ir_version: IR_VERSION,
            producer_name: "marten".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            opset_import: vec![OperatorSetId {
                domain: String::new(),
                version: opset,
            }],
            graph: GraphProto::default(),
        }
    }

    /// Opset version of the default domain.
    pub fn opset_version(&self) -> i64 {
        self.opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map(|o| o.version)
            .unwrap_or(DEFAULT_OPSET)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = PbDecoder::new(data);
        let mut model = ModelProto::default();
        let mut has_graph = false;
        while dec.remaining() > 0 {
            let (field, wire_type) = dec.read_tag()?;
            match (field, wire_type) {
                (1, 0) => model.ir_version = dec.read_varint()? as i64,
                (2, 2) => model.producer_name = dec.read_string()?,
                (3, 2) => model.producer_version = dec.read_string()?,
                (7, 2) => {
                    model.graph = GraphProto::decode(dec.read_bytes()?)?;
                    has_graph = true;
                }
                (8, 2) => {
                    let mut sub = PbDecoder::new(dec.read_bytes()?);
                    let mut opset = OperatorSetId::default();
                    while sub.remaining() > 0 {
                        match sub.read_tag()? {
                            (1, 2) => opset.domain = sub.read_string()?,
                            (2, 0) => opset.version = sub.read_varint()? as i64,
                            (_, w) => sub.skip_field(w)?,
                        }
                    }
                    model.opset_import.push(opset);
                }
                _ => dec.skip_field(wire_type)?,
            }
        }
        if !has_graph {
            return Err(Error::Decode("model contains no graph".into()));
        }
        Ok(model)
    }

    /// Encode to ONNX protobuf bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut model = PbEncoder::new();
        model.write_int64_field(1, self.ir_version);
        model.write_string_field(2, &self.producer_name);
        model.write_string_field(3, &self.producer_version);
        model.write_message_field(7, self.graph.encode());
        for opset in &self.opset_import {
            let mut enc = PbEncoder::new();
            enc.write_string_field(1, &opset.domain);
            enc.write_int64_field(2, opset.version);
            model.write_message_field(8, enc);
        }
        model.into_bytes()
    }

    /// Write the encoded model to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelProto {
        let mut model = ModelProto::new(17);
        model.graph.name = "g".into();
        model.graph.nodes.push(
            NodeProto::new("Gemm", &["x", "w", ""], &["y"])
                .with_name("fc")
                .with_attr("alpha", Attribute::Float(0.5))
                .with_attr("transB", Attribute::Int(1))
                .with_attr("perm", Attribute::Ints(vec![1, -1]))
                .with_attr("mode", Attribute::String("edge".into()))
                .with_attr("value", Attribute::Tensor(TensorProto::from_i64("", &[2], &[-3, 4]))),
        );
        model
            .graph
            .initializers
            .push(TensorProto::from_f32("w", &[2, 2], &[1.0, -2.0, 3.5, 0.0]));
        model.graph.inputs.push(ValueInfo::new("x", &[1, 2]));
        model.graph.outputs.push(ValueInfo {
            name: "y".into(),
            elem_type: FLOAT,
            dims: vec![Dim::Param("batch".into()), Dim::Value(2)],
        });
        model
    }

    #[test]
    fn test_decode_what_encoder_writes() {
        let model = sample();
        let back = ModelProto::decode(&model.encode()).unwrap();
        assert_eq!(back, model);
        assert_eq!(back.opset_version(), 17);
        assert_eq!(back.graph.nodes[0].inputs[2], "");
    }

    #[test]
    fn test_negative_int64_survives() {
        let t = TensorProto::from_i64("s", &[3], &[-1, 0, i64::MIN]);
        let back = TensorProto::decode(&t.encode().into_bytes()).unwrap();
        assert_eq!(back.int64_data, vec![-1, 0, i64::MIN]);
    }

    #[test]
    fn test_raw_data_float16() {
        let raw: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect();
        let t = TensorProto {
            data_type: FLOAT16,
            dims: vec![2],
            raw_data: raw,
            ..Default::default()
        };
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_raw_data_int64() {
        let raw: Vec<u8> = [7i64, -3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let t = TensorProto {
            data_type: INT64,
            dims: vec![2],
            raw_data: raw,
            ..Default::default()
        };
        assert_eq!(t.to_f32_vec().unwrap(), vec![7.0, -3.0]);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = sample().encode();
        let err = ModelProto::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_missing_graph() {
        let err = ModelProto::decode(&[0x08, 0x07]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_negative_dim_has_no_count() {
        let t = TensorProto::from_f32("bad", &[2, -1], &[]);
        assert_eq!(t.shape_elem_count(), None);
    }

    #[test]
    fn test_overflowing_dims_have_no_count() {
        let t = TensorProto::from_f32("huge", &[1 << 40, 1 << 40], &[]);
        assert_eq!(t.shape_elem_count(), None);
    }
}
