//! The `"Noct Bytecode"` image container
//!
//! An image carries one or more function records. Layout (all integers
//! big-endian):
//!
//! ```text
//! "Noct Bytecode"                  13-byte magic
//! u32  function count
//! per function:
//!   u8   name length, name bytes
//!   u8   source file name length, file name bytes
//!   u8   parameter count
//!     per parameter: u8 length, name bytes
//!   u16  temporary-slot count
//!   u32  body length, body bytes
//! ```
//!
//! Truncated input, counts over the instruction-set limits, or trailing
//! garbage reject the whole image; installation is all-or-nothing.

use crate::{string_hash, BytecodeError, Opcode, ARG_MAX, TMPVAR_MAX};

/// The 13-byte magic at the start of every image file.
pub const IMAGE_MAGIC: &[u8; 13] = b"Noct Bytecode";

/// One function record decoded from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    /// Function name (binds the global symbol of the same name)
    pub name: String,
    /// Source file the function was compiled from, for diagnostics
    pub file_name: String,
    /// Parameter names, in declaration order
    pub params: Vec<String>,
    /// Number of temporary slots the body may address
    pub tmpvar_count: u16,
    /// The instruction stream
    pub body: Vec<u8>,
}

/// A decoded image: the list of function records it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionImage {
    /// Function records in file order
    pub functions: Vec<FunctionRecord>,
}

impl FunctionImage {
    /// Serialize the image to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(IMAGE_MAGIC);
        out.extend_from_slice(&(self.functions.len() as u32).to_be_bytes());
        for func in &self.functions {
            out.push(func.name.len() as u8);
            out.extend_from_slice(func.name.as_bytes());
            out.push(func.file_name.len() as u8);
            out.extend_from_slice(func.file_name.as_bytes());
            out.push(func.params.len() as u8);
            for param in &func.params {
                out.push(param.len() as u8);
                out.extend_from_slice(param.as_bytes());
            }
            out.extend_from_slice(&func.tmpvar_count.to_be_bytes());
            out.extend_from_slice(&(func.body.len() as u32).to_be_bytes());
            out.extend_from_slice(&func.body);
        }
        out
    }
}

/// Streaming decoder for an image byte buffer.
pub struct ImageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    /// Decode a whole image. Rejects trailing bytes after the last record.
    pub fn parse(data: &'a [u8]) -> Result<FunctionImage, BytecodeError> {
        let mut reader = ImageReader { data, pos: 0 };

        let magic = reader.take(IMAGE_MAGIC.len())?;
        if magic != IMAGE_MAGIC {
            return Err(BytecodeError::BadImage("missing magic"));
        }

        let count = reader.u32()?;
        let mut functions = Vec::new();
        for _ in 0..count {
            functions.push(reader.function()?);
        }
        if reader.pos != reader.data.len() {
            return Err(BytecodeError::BadImage("trailing bytes after last record"));
        }
        Ok(FunctionImage { functions })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        if self.pos + n > self.data.len() {
            return Err(BytecodeError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BytecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BytecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<String, BytecodeError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BytecodeError::BadImage("name is not UTF-8"))
    }

    fn function(&mut self) -> Result<FunctionRecord, BytecodeError> {
        let name = self.name()?;
        let file_name = self.name()?;
        let param_count = self.u8()? as usize;
        if param_count > ARG_MAX {
            return Err(BytecodeError::BadImage("too many parameters"));
        }
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(self.name()?);
        }
        let tmpvar_count = self.u16()?;
        if tmpvar_count as usize > TMPVAR_MAX {
            return Err(BytecodeError::BadImage("too many temporary slots"));
        }
        let body_len = self.u32()? as usize;
        let body = self.take(body_len)?.to_vec();
        Ok(FunctionRecord { name, file_name, params, tmpvar_count, body })
    }
}

/// Instruction-level encoder for one function body.
///
/// Used by the compiler back end and by tests that hand-assemble
/// functions. Emission mirrors the reader exactly; what the encoder
/// writes, the reader decodes.
#[derive(Debug, Default)]
pub struct BytecodeEncoder {
    code: Vec<u8>,
}

impl BytecodeEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical PC: the offset the next instruction will start at.
    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    /// Finish and return the body bytes.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    fn tmpvar(&mut self, index: u16) -> &mut Self {
        self.code.extend_from_slice(&index.to_be_bytes());
        self
    }

    fn imm32(&mut self, value: u32) -> &mut Self {
        self.code.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn string(&mut self, s: &str) -> &mut Self {
        self.code.extend_from_slice(&(s.len() as u32).to_be_bytes());
        self.code.extend_from_slice(&string_hash(s.as_bytes()).to_be_bytes());
        self.code.extend_from_slice(s.as_bytes());
        self
    }

    /// Emit LINEINFO.
    pub fn line_info(&mut self, line: u32) -> &mut Self {
        self.op(Opcode::LineInfo).imm32(line)
    }

    /// Emit ASSIGN.
    pub fn assign(&mut self, dst: u16, src: u16) -> &mut Self {
        self.op(Opcode::Assign).tmpvar(dst).tmpvar(src)
    }

    /// Emit ICONST.
    pub fn iconst(&mut self, dst: u16, value: i32) -> &mut Self {
        self.op(Opcode::IConst).tmpvar(dst).imm32(value as u32)
    }

    /// Emit FCONST.
    pub fn fconst(&mut self, dst: u16, value: f32) -> &mut Self {
        self.op(Opcode::FConst).tmpvar(dst).imm32(value.to_bits())
    }

    /// Emit SCONST.
    pub fn sconst(&mut self, dst: u16, value: &str) -> &mut Self {
        self.op(Opcode::SConst).tmpvar(dst);
        self.string(value)
    }

    /// Emit ACONST.
    pub fn aconst(&mut self, dst: u16) -> &mut Self {
        self.op(Opcode::AConst).tmpvar(dst)
    }

    /// Emit DCONST.
    pub fn dconst(&mut self, dst: u16) -> &mut Self {
        self.op(Opcode::DConst).tmpvar(dst)
    }

    /// Emit INC.
    pub fn inc(&mut self, dst: u16) -> &mut Self {
        self.op(Opcode::Inc).tmpvar(dst)
    }

    /// Emit a three-slot binary operation (Add..Shr, Lt..Gt, EqI).
    pub fn binary(&mut self, op: Opcode, dst: u16, src1: u16, src2: u16) -> &mut Self {
        self.op(op).tmpvar(dst).tmpvar(src1).tmpvar(src2)
    }

    /// Emit a two-slot unary operation (Neg, Not, Len).
    pub fn unary(&mut self, op: Opcode, dst: u16, src: u16) -> &mut Self {
        self.op(op).tmpvar(dst).tmpvar(src)
    }

    /// Emit LOADARRAY.
    pub fn load_array(&mut self, dst: u16, container: u16, index: u16) -> &mut Self {
        self.op(Opcode::LoadArray).tmpvar(dst).tmpvar(container).tmpvar(index)
    }

    /// Emit STOREARRAY.
    pub fn store_array(&mut self, container: u16, index: u16, value: u16) -> &mut Self {
        self.op(Opcode::StoreArray).tmpvar(container).tmpvar(index).tmpvar(value)
    }

    /// Emit GETDICTKEYBYINDEX.
    pub fn get_dict_key_by_index(&mut self, dst: u16, dict: u16, index: u16) -> &mut Self {
        self.op(Opcode::GetDictKeyByIndex).tmpvar(dst).tmpvar(dict).tmpvar(index)
    }

    /// Emit GETDICTVALBYINDEX.
    pub fn get_dict_val_by_index(&mut self, dst: u16, dict: u16, index: u16) -> &mut Self {
        self.op(Opcode::GetDictValByIndex).tmpvar(dst).tmpvar(dict).tmpvar(index)
    }

    /// Emit LOADSYMBOL.
    pub fn load_symbol(&mut self, dst: u16, name: &str) -> &mut Self {
        self.op(Opcode::LoadSymbol).tmpvar(dst);
        self.string(name)
    }

    /// Emit STORESYMBOL.
    pub fn store_symbol(&mut self, name: &str, src: u16) -> &mut Self {
        self.op(Opcode::StoreSymbol).string(name).tmpvar(src)
    }

    /// Emit LOADDOT.
    pub fn load_dot(&mut self, dst: u16, dict: u16, field: &str) -> &mut Self {
        self.op(Opcode::LoadDot).tmpvar(dst).tmpvar(dict);
        self.string(field)
    }

    /// Emit STOREDOT.
    pub fn store_dot(&mut self, dict: u16, field: &str, src: u16) -> &mut Self {
        self.op(Opcode::StoreDot).tmpvar(dict).string(field).tmpvar(src)
    }

    /// Emit CALL.
    pub fn call(&mut self, dst: u16, func: u16, args: &[u16]) -> &mut Self {
        self.op(Opcode::Call).tmpvar(dst).tmpvar(func);
        self.code.push(args.len() as u8);
        for &arg in args {
            self.tmpvar(arg);
        }
        self
    }

    /// Emit THISCALL.
    pub fn this_call(&mut self, dst: u16, recv: u16, name: &str, args: &[u16]) -> &mut Self {
        self.op(Opcode::ThisCall).tmpvar(dst).tmpvar(recv).string(name);
        self.code.push(args.len() as u8);
        for &arg in args {
            self.tmpvar(arg);
        }
        self
    }

    /// Emit JMP.
    pub fn jmp(&mut self, target: u32) -> &mut Self {
        self.op(Opcode::Jmp).imm32(target)
    }

    /// Emit JMPIFTRUE.
    pub fn jmp_if_true(&mut self, cond: u16, target: u32) -> &mut Self {
        self.op(Opcode::JmpIfTrue).tmpvar(cond).imm32(target)
    }

    /// Emit JMPIFFALSE.
    pub fn jmp_if_false(&mut self, cond: u16, target: u32) -> &mut Self {
        self.op(Opcode::JmpIfFalse).tmpvar(cond).imm32(target)
    }

    /// Emit JMPIFEQ.
    pub fn jmp_if_eq(&mut self, target: u32) -> &mut Self {
        self.op(Opcode::JmpIfEq).imm32(target)
    }

    /// Back-patch the imm32 operand of a JMP-family instruction emitted at
    /// `at` (the PC returned by [`pc`](Self::pc) before emitting it).
    pub fn patch_jump(&mut self, at: u32, target: u32) {
        let op = Opcode::from_byte(self.code[at as usize]).expect("patching a real instruction");
        let operand_at = match op {
            Opcode::Jmp | Opcode::JmpIfEq => at as usize + 1,
            Opcode::JmpIfTrue | Opcode::JmpIfFalse => at as usize + 3,
            _ => panic!("patch_jump on a non-jump instruction"),
        };
        self.code[operand_at..operand_at + 4].copy_from_slice(&target.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BytecodeReader;

    fn sample_image() -> FunctionImage {
        let mut enc = BytecodeEncoder::new();
        enc.iconst(0, 42);
        FunctionImage {
            functions: vec![FunctionRecord {
                name: "main".to_string(),
                file_name: "main.nc".to_string(),
                params: vec![],
                tmpvar_count: 4,
                body: enc.finish(),
            }],
        }
    }

    #[test]
    fn test_image_round_trip() {
        let image = sample_image();
        let bytes = image.to_bytes();
        let parsed = ImageReader::parse(&bytes).unwrap();
        assert_eq!(parsed, image);
    }

    #[test]
    fn test_image_rejects_bad_magic() {
        let mut bytes = sample_image().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ImageReader::parse(&bytes),
            Err(BytecodeError::BadImage("missing magic"))
        ));
    }

    #[test]
    fn test_image_rejects_truncation() {
        let bytes = sample_image().to_bytes();
        for cut in 1..bytes.len() {
            assert!(ImageReader::parse(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_image_rejects_trailing_bytes() {
        let mut bytes = sample_image().to_bytes();
        bytes.push(0);
        assert!(matches!(
            ImageReader::parse(&bytes),
            Err(BytecodeError::BadImage("trailing bytes after last record"))
        ));
    }

    #[test]
    fn test_image_rejects_excess_tmpvars() {
        let mut image = sample_image();
        image.functions[0].tmpvar_count = (TMPVAR_MAX + 1) as u16;
        assert!(ImageReader::parse(&image.to_bytes()).is_err());
    }

    #[test]
    fn test_encoder_reader_agree_on_call() {
        let mut enc = BytecodeEncoder::new();
        enc.call(0, 1, &[2, 3]);
        let body = enc.finish();
        let mut r = BytecodeReader::new(&body, 8);
        assert_eq!(r.opcode().unwrap(), Opcode::Call);
        assert_eq!(r.tmpvar().unwrap(), 0);
        assert_eq!(r.tmpvar().unwrap(), 1);
        assert_eq!(r.arg_count().unwrap(), 2);
        assert_eq!(r.tmpvar().unwrap(), 2);
        assert_eq!(r.tmpvar().unwrap(), 3);
        assert!(r.at_end());
    }

    #[test]
    fn test_patch_jump() {
        let mut enc = BytecodeEncoder::new();
        let at = enc.pc();
        enc.jmp(0);
        enc.iconst(0, 1);
        let end = enc.pc();
        enc.patch_jump(at, end);
        let body = enc.finish();
        let mut r = BytecodeReader::new(&body, 4);
        assert_eq!(r.opcode().unwrap(), Opcode::Jmp);
        assert_eq!(r.imm32().unwrap(), end);
    }
}
