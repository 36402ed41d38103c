//! Argument marshalling
//!
//! Converts between the word-level calling convention and [`Value`]s, driven
//! by the reflected method signature. A [`Marshaller`] works on the memory
//! and capability table of one process; its [`Side`] decides what an
//! interface pointer word means there.
//!
//! Word layout of a call: hidden return words first (see
//! [`TypeSpec::hidden_return_words`]), then each parameter in order. A
//! method returning "any" additionally receives the address of a two-word
//! variant slot `[tag, payload]`, passed outside the word list.
//!
//! Every buffer is validated for its full extent before it is read, with
//! write permission for outputs and return buffers. Strings are scanned for
//! their terminator up to `max_marshal_bytes`.

use crate::object::{ObjectRef, Value};
use crate::process::Process;
use crate::upcall::{OutputCopy, UpcallRecord, UpcallTable};
use core_types::WORD_SIZE;
use kernel_api::{KernelError, Resource};
use reflect::{AnyTag, Direction, MethodSignature, TypeSpec};
use std::sync::Arc;

/// What an interface pointer word means to the process being marshalled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Arguments from a system call. Export addresses become upcall slots.
    Caller,
    /// Arguments read by a server's dispatch stub. Export addresses are the
    /// server's own objects.
    Server,
    /// A result left in server memory. Invalid slots are bad descriptors.
    ServerResult,
}

/// Where a non-scalar result is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnBuffer {
    None,
    Str { addr: u64, len: u64 },
    Seq { addr: u64, count: u64 },
    Array { addr: u64, length: u64 },
    /// Variant slot plus a buffer for a string payload
    Variant { slot: u64, buf: u64, len: u64 },
}

/// An output parameter to copy back after the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    pub index: usize,
    pub addr: u64,
    pub size: usize,
}

#[derive(Debug)]
pub struct DecodedCall {
    pub args: Vec<Value>,
    pub outputs: Vec<OutputBuffer>,
    pub ret: ReturnBuffer,
}

/// A call laid out in server memory by [`Marshaller::encode_call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCall {
    pub variant_slot: Option<u64>,
    pub ret: ReturnBuffer,
    pub words: Vec<u64>,
}

pub struct Marshaller<'a> {
    process: &'a Process,
    upcalls: &'a Arc<UpcallTable>,
    max_bytes: u64,
    side: Side,
    new_slots: Vec<u32>,
}

impl<'a> Marshaller<'a> {
    pub fn new(process: &'a Process, upcalls: &'a Arc<UpcallTable>, max_bytes: u64, side: Side) -> Self {
        Self {
            process,
            upcalls,
            max_bytes,
            side,
            new_slots: Vec::new(),
        }
    }

    /// Capability slots created so far
    pub fn take_new_slots(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.new_slots)
    }

    /// Decodes argument words into values
    pub fn decode_call(
        &mut self,
        sig: &MethodSignature,
        variant_slot: Option<u64>,
        words: &[u64],
    ) -> Result<DecodedCall, KernelError> {
        let hidden = sig.returns.hidden_return_words();
        let needed = hidden + sig.argument_words();
        if words.len() < needed {
            return Err(KernelError::InvalidArgument(format!(
                "{} takes {} argument words, got {}",
                sig.name,
                needed,
                words.len()
            )));
        }
        let ret = self.return_buffer(&sig.returns, variant_slot, &words[..hidden])?;

        let mut cursor = hidden;
        let mut args = Vec::with_capacity(sig.params.len());
        let mut outputs = Vec::new();
        for (index, param) in sig.params.iter().enumerate() {
            let w = &words[cursor..cursor + param.ty.word_count()];
            cursor += param.ty.word_count();
            let value = match &param.ty {
                TypeSpec::String => Value::Str(self.read_string(w[0])?),
                TypeSpec::Sequence { .. } => {
                    let size = self.buffer_size(&param.ty, w[1])?;
                    self.decode_buffer(
                        index,
                        param.direction,
                        w[0],
                        size,
                        &mut outputs,
                    )?
                }
                TypeSpec::Array { length, .. } => {
                    let size = self.buffer_size(&param.ty, u64::from(*length))?;
                    self.decode_buffer(
                        index,
                        param.direction,
                        w[0],
                        size,
                        &mut outputs,
                    )?
                }
                TypeSpec::Interface { .. } => Value::Object(self.decode_object(w[0])?),
                TypeSpec::Any => Value::Any(Box::new(self.decode_any(w[0], w[1])?)),
                ty => Value::from_word(ty, w[0]).ok_or_else(|| {
                    KernelError::InvalidArgument(format!("cannot pass {:?} by value", ty))
                })?,
            };
            args.push(value);
        }
        Ok(DecodedCall { args, outputs, ret })
    }

    fn return_buffer(
        &self,
        returns: &TypeSpec,
        variant_slot: Option<u64>,
        hidden: &[u64],
    ) -> Result<ReturnBuffer, KernelError> {
        let ret = match returns {
            TypeSpec::String => {
                self.check_writable(hidden[0], hidden[1])?;
                ReturnBuffer::Str {
                    addr: hidden[0],
                    len: hidden[1],
                }
            }
            TypeSpec::Sequence { .. } => {
                let size = self.buffer_size(returns, hidden[1])?;
                self.check_writable(hidden[0], size as u64)?;
                ReturnBuffer::Seq {
                    addr: hidden[0],
                    count: hidden[1],
                }
            }
            TypeSpec::Array { length, .. } => {
                let size = self.buffer_size(returns, u64::from(*length))?;
                self.check_writable(hidden[0], size as u64)?;
                ReturnBuffer::Array {
                    addr: hidden[0],
                    length: u64::from(*length),
                }
            }
            TypeSpec::Any => {
                let slot = variant_slot.ok_or_else(|| {
                    KernelError::InvalidArgument("variant return without a slot".to_string())
                })?;
                self.check_writable(slot, 2 * WORD_SIZE)?;
                self.check_writable(hidden[0], hidden[1])?;
                ReturnBuffer::Variant {
                    slot,
                    buf: hidden[0],
                    len: hidden[1],
                }
            }
            _ => ReturnBuffer::None,
        };
        Ok(ret)
    }

    fn check_writable(&self, addr: u64, len: u64) -> Result<(), KernelError> {
        if len > 0 && !self.process.is_valid(addr, len, true) {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(())
    }

    fn buffer_size(&self, ty: &TypeSpec, count: u64) -> Result<usize, KernelError> {
        let element = ty.element_size().ok_or_else(|| {
            KernelError::InvalidArgument(format!("{:?} is not a buffer", ty))
        })?;
        match count.checked_mul(element as u64) {
            Some(size) if size <= self.max_bytes => Ok(size as usize),
            _ => Err(KernelError::ResourceExhausted(Resource::MarshalBuffer)),
        }
    }

    fn decode_buffer(
        &self,
        index: usize,
        direction: Direction,
        addr: u64,
        size: usize,
        outputs: &mut Vec<OutputBuffer>,
    ) -> Result<Value, KernelError> {
        let output = direction.is_output();
        if size == 0 {
            return Ok(Value::Bytes(Vec::new()));
        }
        if !self.process.is_valid(addr, size as u64, output) {
            return Err(KernelError::MemoryFault { addr });
        }
        let bytes = if direction.is_input() {
            self.read_bytes(addr, size)?
        } else {
            vec![0; size]
        };
        if output {
            outputs.push(OutputBuffer { index, addr, size });
        }
        Ok(Value::Bytes(bytes))
    }

    fn read_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>, KernelError> {
        let mut bytes = vec![0; size];
        let n = self.process.read(addr, &mut bytes);
        if n != size {
            return Err(KernelError::MemoryFault { addr: addr + n as u64 });
        }
        Ok(bytes)
    }

    /// Reads a NUL-terminated string
    pub fn read_string(&self, addr: u64) -> Result<String, KernelError> {
        if addr == 0 {
            return Err(KernelError::MemoryFault { addr });
        }
        let mut bytes = Vec::new();
        let mut cursor = addr;
        while (bytes.len() as u64) < self.max_bytes {
            let chunk = (core_types::page_trunc(cursor) + core_types::PAGE_SIZE - cursor)
                .min(self.max_bytes - bytes.len() as u64);
            let mut buf = vec![0u8; chunk as usize];
            let n = self.process.read(cursor, &mut buf);
            if let Some(nul) = buf[..n].iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&buf[..nul]);
                return String::from_utf8(bytes)
                    .map_err(|_| KernelError::InvalidArgument("string is not UTF-8".to_string()));
            }
            if n < buf.len() {
                return Err(KernelError::MemoryFault {
                    addr: cursor + n as u64,
                });
            }
            bytes.extend_from_slice(&buf);
            cursor += chunk;
        }
        Err(KernelError::ResourceExhausted(Resource::MarshalBuffer))
    }

    fn decode_any(&mut self, tag: u64, payload: u64) -> Result<Value, KernelError> {
        let tag = AnyTag::from_word(tag)
            .ok_or_else(|| KernelError::InvalidArgument(format!("bad variant tag {}", tag)))?;
        match tag {
            AnyTag::Str => Ok(Value::Str(self.read_string(payload)?)),
            AnyTag::Object => Ok(Value::Object(self.decode_object(payload)?)),
            scalar => scalar
                .scalar_type()
                .and_then(|ty| Value::from_word(&ty, payload))
                .ok_or_else(|| KernelError::InvalidArgument(format!("bad variant tag {:?}", scalar))),
        }
    }

    /// Resolves an interface pointer word to an object reference
    pub fn decode_object(&mut self, word: u64) -> Result<Option<ObjectRef>, KernelError> {
        if word == 0 {
            return Ok(None);
        }
        if let Some(index) = self.process.slot_index(word) {
            return match self.process.table().get(index) {
                Some(object) => Ok(Some(object)),
                None if self.side == Side::ServerResult => Err(KernelError::BadDescriptor(format!(
                    "server returned empty slot {}",
                    index
                ))),
                None => Err(KernelError::InvalidArgument(format!(
                    "slot {} is empty",
                    index
                ))),
            };
        }
        if let Some(export) = self.process.export_at(word) {
            return match self.side {
                Side::Server => Ok(Some(ObjectRef::new(export.object))),
                Side::Caller | Side::ServerResult => {
                    let proxy =
                        self.upcalls
                            .set(self.process.id(), export.object, export.addr, &export.iid)?;
                    Ok(Some(ObjectRef::Upcall(proxy)))
                }
            };
        }
        Err(KernelError::InvalidArgument(format!(
            "{:#x} is not an interface pointer",
            word
        )))
    }

    /// Copies output parameters back to their buffers
    pub fn write_outputs(&self, outputs: &[OutputBuffer], args: &[Value]) -> Result<(), KernelError> {
        for output in outputs {
            let bytes = args
                .get(output.index)
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| KernelError::InvalidArgument(format!("output {} lost", output.index)))?;
            let len = bytes.len().min(output.size);
            if self.process.write(output.addr, &bytes[..len]) != len {
                return Err(KernelError::MemoryFault { addr: output.addr });
            }
        }
        Ok(())
    }

    /// Encodes a result into a result word, writing buffers as needed
    pub fn encode_result(
        &mut self,
        sig: &MethodSignature,
        ret: &ReturnBuffer,
        args: &[Value],
        value: Value,
    ) -> Result<u64, KernelError> {
        match (&sig.returns, value) {
            (TypeSpec::Void, _) => Ok(0),
            (TypeSpec::String, Value::Str(s)) => match *ret {
                ReturnBuffer::Str { addr, len } => self.write_string(addr, len, &s),
                _ => Err(missing_buffer(sig)),
            },
            (TypeSpec::Sequence { .. }, Value::Bytes(bytes)) => match *ret {
                ReturnBuffer::Seq { addr, count } => {
                    let capacity = self.buffer_size(&sig.returns, count)?;
                    self.write_buffer(addr, capacity, &bytes)?;
                    let element = sig.returns.element_size().unwrap_or(1);
                    Ok((bytes.len() / element) as u64)
                }
                _ => Err(missing_buffer(sig)),
            },
            (TypeSpec::Array { .. }, Value::Bytes(bytes)) => match *ret {
                ReturnBuffer::Array { addr, length } => {
                    let capacity = self.buffer_size(&sig.returns, length)?;
                    self.write_buffer(addr, capacity, &bytes)?;
                    Ok(0)
                }
                _ => Err(missing_buffer(sig)),
            },
            (TypeSpec::Interface { iid }, Value::Object(object)) => {
                let iid = result_iid(sig, args, iid);
                self.encode_object(object, &iid)
            }
            (TypeSpec::Any, Value::Any(inner)) => match *ret {
                ReturnBuffer::Variant { slot, buf, len } => {
                    let tag = inner.any_tag().ok_or_else(|| {
                        KernelError::InvalidArgument("value cannot be a variant".to_string())
                    })?;
                    let payload = match *inner {
                        Value::Str(s) => self.write_string(buf, len, &s)?,
                        Value::Object(object) => {
                            let iid = object.as_ref().map(object_iid).unwrap_or_default();
                            self.encode_object(object, &iid)?
                        }
                        scalar => scalar.to_word().unwrap_or(0),
                    };
                    let mut words = [0u8; 16];
                    words[..8].copy_from_slice(&tag.as_word().to_le_bytes());
                    words[8..].copy_from_slice(&payload.to_le_bytes());
                    if self.process.write(slot, &words) != words.len() {
                        return Err(KernelError::MemoryFault { addr: slot });
                    }
                    Ok(slot)
                }
                _ => Err(missing_buffer(sig)),
            },
            (ty, value) if ty.is_scalar() => value.to_word().ok_or_else(|| mismatch(sig)),
            _ => Err(mismatch(sig)),
        }
    }

    fn write_string(&self, addr: u64, len: u64, s: &str) -> Result<u64, KernelError> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        if bytes.len() as u64 > len {
            return Err(KernelError::ResourceExhausted(Resource::MarshalBuffer));
        }
        if self.process.write(addr, &bytes) != bytes.len() {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(addr)
    }

    fn write_buffer(&self, addr: u64, capacity: usize, bytes: &[u8]) -> Result<(), KernelError> {
        if bytes.len() > capacity {
            return Err(KernelError::ResourceExhausted(Resource::MarshalBuffer));
        }
        if self.process.write(addr, bytes) != bytes.len() {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(())
    }

    /// Encodes an object reference as an interface pointer word
    ///
    /// A caller gets a new slot it owns. A server sees its own exported
    /// objects at their export address and anything else through a slot of
    /// its table, reusing one that already holds the object.
    pub fn encode_object(&mut self, object: Option<ObjectRef>, iid: &str) -> Result<u64, KernelError> {
        let object = match object {
            Some(object) => object,
            None => return Ok(0),
        };
        let table = self.process.table();
        match self.side {
            Side::Caller => {
                if let ObjectRef::Upcall(proxy) = &object {
                    self.upcalls.mark_used(proxy.handle())?;
                }
                let index = table.set(object, iid, true)?;
                self.new_slots.push(index);
                Ok(self.process.slot_address(index))
            }
            Side::Server | Side::ServerResult => {
                if let Some(addr) = self.export_address(&object) {
                    return Ok(addr);
                }
                if let Some(index) = table.find(&object) {
                    return Ok(self.process.slot_address(index));
                }
                let index = table.set(object, iid, false)?;
                self.new_slots.push(index);
                Ok(self.process.slot_address(index))
            }
        }
    }

    fn export_address(&self, object: &ObjectRef) -> Option<u64> {
        match object {
            ObjectRef::Kernel(object) => self.process.export_address_of(object),
            ObjectRef::Upcall(proxy) => proxy
                .entry()
                .ok()
                .filter(|entry| entry.process == self.process.id())
                .map(|entry| entry.addr),
        }
    }

    /// Lays a client's call out on a record's stack in server memory
    ///
    /// Output buffers are recorded on the record; slots created for object
    /// arguments are recorded as temporary.
    pub fn encode_call(
        &mut self,
        record: &mut UpcallRecord,
        sig: &MethodSignature,
        client_ret: &ReturnBuffer,
        args: &[Value],
    ) -> Result<EncodedCall, KernelError> {
        let mut words = Vec::with_capacity(sig.argument_words() + 2);
        let mut variant_slot = None;
        let ret = match (&sig.returns, client_ret) {
            (TypeSpec::String, _) => {
                let addr = record.push(self.max_bytes)?;
                words.extend([addr, self.max_bytes]);
                ReturnBuffer::Str {
                    addr,
                    len: self.max_bytes,
                }
            }
            (TypeSpec::Any, _) => {
                let slot = record.push(2 * WORD_SIZE)?;
                let buf = record.push(self.max_bytes)?;
                words.extend([buf, self.max_bytes]);
                variant_slot = Some(slot);
                ReturnBuffer::Variant {
                    slot,
                    buf,
                    len: self.max_bytes,
                }
            }
            (TypeSpec::Sequence { .. }, ReturnBuffer::Seq { count, .. }) => {
                let size = self.buffer_size(&sig.returns, *count)?;
                let addr = record.push(size as u64)?;
                words.extend([addr, *count]);
                ReturnBuffer::Seq { addr, count: *count }
            }
            (TypeSpec::Array { length, .. }, _) => {
                let size = self.buffer_size(&sig.returns, u64::from(*length))?;
                let addr = record.push(size as u64)?;
                words.push(addr);
                ReturnBuffer::Array {
                    addr,
                    length: u64::from(*length),
                }
            }
            (TypeSpec::Sequence { .. }, _) => return Err(missing_buffer(sig)),
            _ => ReturnBuffer::None,
        };

        let encoded = self.encode_args(record, sig, args, &mut words);
        record.temp_slots.extend(self.take_new_slots());
        encoded?;
        Ok(EncodedCall {
            variant_slot,
            ret,
            words,
        })
    }

    fn encode_args(
        &mut self,
        record: &mut UpcallRecord,
        sig: &MethodSignature,
        args: &[Value],
        words: &mut Vec<u64>,
    ) -> Result<(), KernelError> {
        if args.len() != sig.params.len() {
            return Err(mismatch(sig));
        }
        for (index, (param, value)) in sig.params.iter().zip(args).enumerate() {
            match (&param.ty, value) {
                (TypeSpec::String, Value::Str(s)) => {
                    words.push(self.push_bytes(record, s.as_bytes(), true)?);
                }
                (TypeSpec::Sequence { .. }, Value::Bytes(bytes)) => {
                    let addr = self.push_bytes(record, bytes, false)?;
                    if param.direction.is_output() {
                        record.outputs.push(OutputCopy {
                            index,
                            server_addr: addr,
                            size: bytes.len(),
                        });
                    }
                    let element = param.ty.element_size().unwrap_or(1);
                    words.extend([addr, (bytes.len() / element) as u64]);
                }
                (TypeSpec::Array { .. }, Value::Bytes(bytes)) => {
                    let addr = self.push_bytes(record, bytes, false)?;
                    if param.direction.is_output() {
                        record.outputs.push(OutputCopy {
                            index,
                            server_addr: addr,
                            size: bytes.len(),
                        });
                    }
                    words.push(addr);
                }
                (TypeSpec::Interface { iid }, Value::Object(object)) => {
                    let iid = param
                        .iid_is
                        .and_then(|i| args.get(i))
                        .and_then(|v| v.as_str())
                        .unwrap_or(iid)
                        .to_string();
                    words.push(self.encode_object(object.clone(), &iid)?);
                }
                (TypeSpec::Any, Value::Any(inner)) => {
                    let tag = inner.any_tag().ok_or_else(|| mismatch(sig))?;
                    let payload = match inner.as_ref() {
                        Value::Str(s) => self.push_bytes(record, s.as_bytes(), true)?,
                        Value::Object(object) => {
                            let iid = object.as_ref().map(object_iid).unwrap_or_default();
                            self.encode_object(object.clone(), &iid)?
                        }
                        scalar => scalar.to_word().unwrap_or(0),
                    };
                    words.extend([tag.as_word(), payload]);
                }
                (ty, value) if ty.is_scalar() => {
                    words.push(value.to_word().ok_or_else(|| mismatch(sig))?);
                }
                _ => return Err(mismatch(sig)),
            }
        }
        Ok(())
    }

    /// Copies bytes onto the record's stack
    pub fn push_bytes(&self, record: &mut UpcallRecord, bytes: &[u8], nul: bool) -> Result<u64, KernelError> {
        let size = bytes.len() + nul as usize;
        let addr = record.push(size.max(1) as u64)?;
        let mut data = bytes.to_vec();
        if nul {
            data.push(0);
        }
        if self.process.write(addr, &data) != data.len() {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(addr)
    }

    /// Decodes a result a server left in its own memory
    pub fn decode_result(
        &mut self,
        sig: &MethodSignature,
        ret: &ReturnBuffer,
        word: u64,
    ) -> Result<Value, KernelError> {
        match (&sig.returns, *ret) {
            (TypeSpec::Void, _) => Ok(Value::Void),
            (TypeSpec::String, _) => Ok(Value::Str(self.read_string(word)?)),
            (TypeSpec::Sequence { .. }, ReturnBuffer::Seq { addr, count }) => {
                if word > count {
                    return Err(KernelError::ResourceExhausted(Resource::MarshalBuffer));
                }
                let size = self.buffer_size(&sig.returns, word)?;
                Ok(Value::Bytes(self.read_bytes(addr, size)?))
            }
            (TypeSpec::Array { .. }, ReturnBuffer::Array { addr, length }) => {
                let size = self.buffer_size(&sig.returns, length)?;
                Ok(Value::Bytes(self.read_bytes(addr, size)?))
            }
            (TypeSpec::Interface { .. }, _) => Ok(Value::Object(self.decode_object(word)?)),
            (TypeSpec::Any, _) => {
                let bytes = self.read_bytes(word, 2 * WORD_SIZE as usize)?;
                let tag = le_word(&bytes[..8]);
                let payload = le_word(&bytes[8..]);
                Ok(Value::Any(Box::new(self.decode_any(tag, payload)?)))
            }
            (ty, _) => Value::from_word(ty, word).ok_or_else(|| missing_buffer(sig)),
        }
    }
}

/// Interface named by an object reference
pub fn object_iid(object: &ObjectRef) -> String {
    match object {
        ObjectRef::Kernel(object) => object.interface_id().to_string(),
        ObjectRef::Upcall(proxy) => proxy.entry().map(|e| e.iid).unwrap_or_default(),
    }
}

/// Interface of an interface result, honouring `returns_iid_is`
pub fn result_iid(sig: &MethodSignature, args: &[Value], declared: &str) -> String {
    sig.returns_iid_is
        .and_then(|i| args.get(i))
        .and_then(|v| v.as_str())
        .unwrap_or(declared)
        .to_string()
}

fn le_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

fn missing_buffer(sig: &MethodSignature) -> KernelError {
    KernelError::InvalidArgument(format!("{} has no return buffer", sig.name))
}

fn mismatch(sig: &MethodSignature) -> KernelError {
    KernelError::InvalidArgument(format!("value does not match the signature of {}", sig.name))
}
