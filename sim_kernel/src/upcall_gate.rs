//! Upcall dispatch
//!
//! Carries a call made through an upcall slot into the server process that
//! exports the target object.
//!
//! ## Design
//!
//! Each call borrows an [`UpcallRecord`] from the server's pool. A fresh
//! record is first taken through `Init`: the thread leaps into the server,
//! the TLS image and the runtime's startup frame are laid down on the
//! record's stack, and the thread returns to the client with the record
//! `Ready`. A ready record then carries calls:
//!
//! 1. arguments are copied onto the record stack with the kernel `write`
//!    primitive, interface pointers translated for the server
//! 2. the thread leaps into the server and the dispatch stub decodes the
//!    frame from server memory and invokes the object
//! 3. on return, output buffers and the result are copied back out
//!
//! The record goes back to the pool whatever happens; a failed call leaves
//! it in `Init` so the next call starts from a clean stack.

use crate::kernel_audit::KernelEvent;
use crate::marshal::{EncodedCall, Marshaller, ReturnBuffer, Side};
use crate::object::{MethodCall, ObjectRef, Value};
use crate::process::Process;
use crate::thread::UpcallFrame;
use crate::upcall::{RecordState, UpcallEntry, UpcallRecord, UpcallRef};
use crate::SimulatedKernel;
use core_types::{ProcessId, ThreadId, WORD_SIZE};
use kernel_api::KernelError;
use reflect::{ResolvedMethod, RootMethod};
use std::sync::Arc;

/// Words ahead of the argument words in a dispatch frame:
/// export address, method number, variant slot
const FRAME_HEADER_WORDS: usize = 3;

impl SimulatedKernel {
    /// Invokes a method on the object behind an upcall slot
    ///
    /// `client_ret` describes the client's return buffer so a sequence
    /// result can be sized like the client's. Output buffers in `args` are
    /// replaced with what the server wrote.
    pub fn upcall(
        &mut self,
        tid: ThreadId,
        proxy: &UpcallRef,
        resolved: &ResolvedMethod,
        client_ret: &ReturnBuffer,
        args: &mut Vec<Value>,
    ) -> Result<Value, KernelError> {
        let entry = proxy.entry()?;
        let server = self.process_arc(entry.process)?;
        if server.has_exited() {
            return Err(KernelError::BadDescriptor(format!(
                "{} has exited",
                entry.process
            )));
        }

        match resolved.root_method() {
            Some(RootMethod::AddRef) => {
                return Ok(Value::U32(self.upcalls.add_ref(proxy.handle())?));
            }
            Some(RootMethod::Release) => {
                return Ok(Value::U32(self.upcalls.release(proxy.handle())));
            }
            Some(RootMethod::QueryInterface) => {
                let iid = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| KernelError::InvalidArgument("queryInterface needs an iid".to_string()))?
                    .to_string();
                let object = self.query_upcall(&entry, &iid)?.map(ObjectRef::Upcall);
                return Ok(Value::Object(object));
            }
            None => {}
        }

        let client = self
            .scheduler
            .lock()
            .get(tid)
            .and_then(|t| t.current_process)
            .ok_or_else(|| KernelError::InvalidArgument(format!("{} has no process", tid)))?;

        let mut record = server.take_record(self.config.max_upcall_records, &self.faults)?;
        if record.state == RecordState::Init {
            if let Err(err) = self.init_record(tid, client, &server, &mut record) {
                log::warn!("{}: record init failed: {}", server.id(), err);
                record.reset();
                server.put_record(record);
                return Err(err);
            }
        }

        let result = self.leap(tid, client, &server, &entry, resolved, client_ret, args, &mut record);

        for slot in std::mem::take(&mut record.temp_slots) {
            server.table().release(slot);
        }
        match &result {
            Ok(_) => record.clear_call(),
            Err(_) => record.reset(),
        }
        server.put_record(record);
        result
    }

    /// A new upcall slot for the same export, if it supports `iid`
    pub fn query_upcall(&self, entry: &UpcallEntry, iid: &str) -> Result<Option<UpcallRef>, KernelError> {
        if !self.catalog.contains(iid) || !entry.object.query_interface(iid, &self.catalog) {
            return Ok(None);
        }
        let proxy = self
            .upcalls
            .set(entry.process, entry.object.clone(), entry.addr, iid)?;
        Ok(Some(proxy))
    }

    /// Runs the server's runtime on a fresh record stack
    fn init_record(
        &mut self,
        tid: ThreadId,
        client: ProcessId,
        server: &Arc<Process>,
        record: &mut UpcallRecord,
    ) -> Result<(), KernelError> {
        self.leap_into_server(tid, client, server.id())?;
        let result = prepare_stack(server, record);
        self.return_to_client(tid);
        result?;
        record.state = RecordState::Ready;
        self.record(KernelEvent::UpcallRecordInit {
            server: server.id(),
        });
        Ok(())
    }

    fn leap_into_server(&mut self, tid: ThreadId, client: ProcessId, server: ProcessId) -> Result<(), KernelError> {
        self.scheduler.lock().push_upcall(
            tid,
            UpcallFrame {
                client,
                server,
                exit_code: None,
            },
        )?;
        self.record(KernelEvent::AddressSpaceLoaded {
            thread: tid,
            process: server,
        });
        Ok(())
    }

    fn return_to_client(&mut self, tid: ThreadId) -> Option<UpcallFrame> {
        let frame = self.scheduler.lock().pop_upcall(tid);
        if let Some(frame) = &frame {
            self.record(KernelEvent::AddressSpaceLoaded {
                thread: tid,
                process: frame.client,
            });
        }
        frame
    }

    #[allow(clippy::too_many_arguments)]
    fn leap(
        &mut self,
        tid: ThreadId,
        client: ProcessId,
        server: &Arc<Process>,
        entry: &UpcallEntry,
        resolved: &ResolvedMethod,
        client_ret: &ReturnBuffer,
        args: &mut Vec<Value>,
        record: &mut UpcallRecord,
    ) -> Result<Value, KernelError> {
        let sig = &resolved.signature;
        record.client = Some(client);
        record.method = Some(sig.name.clone());

        let upcalls = self.upcalls.clone();
        let max_bytes = self.config.max_marshal_bytes;
        let encoded = Marshaller::new(server, &upcalls, max_bytes, Side::Server)
            .encode_call(record, sig, client_ret, args)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_WORDS + encoded.words.len());
        frame.extend([
            entry.addr,
            u64::from(resolved.number),
            encoded.variant_slot.unwrap_or(0),
        ]);
        frame.extend_from_slice(&encoded.words);
        let frame_addr = record.push(frame.len() as u64 * WORD_SIZE)?;
        server.write_words(frame_addr, &frame)?;
        record.frame = frame;

        self.leap_into_server(tid, client, server.id())?;
        self.record(KernelEvent::UpcallLeap {
            thread: tid,
            client,
            server: server.id(),
            method: sig.name.clone(),
        });
        if server.lock().trace {
            log::debug!("{} leaps {} -> {}: {}", tid, client, server.id(), sig.name);
        }

        let dispatched = self.dispatch_stub(tid, server, entry, resolved, &encoded, frame_addr, record);

        let frame = self.return_to_client(tid);
        let exit_code = frame.and_then(|f| f.exit_code);
        let outcome = match (dispatched, exit_code) {
            (_, Some(code)) => Err(KernelError::ObjectError(code)),
            (Err(err), None) => Err(err),
            (Ok(word), None) => Ok(word),
        };
        self.record(KernelEvent::UpcallReturn {
            thread: tid,
            server: server.id(),
            errno: outcome.as_ref().err().map(|e| e.errno()).unwrap_or(0),
        });
        let word = outcome?;
        record.result = word;
        record.returned = true;

        copy_out(server, record, args)?;
        let mut marshaller = Marshaller::new(server, &upcalls, max_bytes, Side::ServerResult);
        marshaller.decode_result(sig, &encoded.ret, word)
    }

    /// The server side of a call: decode the frame, invoke, encode the result
    #[allow(clippy::too_many_arguments)]
    fn dispatch_stub(
        &mut self,
        tid: ThreadId,
        server: &Arc<Process>,
        entry: &UpcallEntry,
        resolved: &ResolvedMethod,
        encoded: &EncodedCall,
        frame_addr: u64,
        record: &mut UpcallRecord,
    ) -> Result<u64, KernelError> {
        let sig = &resolved.signature;
        let frame = server.read_words(frame_addr, FRAME_HEADER_WORDS + encoded.words.len())?;
        let (header, words) = frame.split_at(FRAME_HEADER_WORDS);
        if header[0] != entry.addr || header[1] != u64::from(resolved.number) {
            return Err(KernelError::ProtocolViolation(format!(
                "frame at {:#x} does not match the call",
                frame_addr
            )));
        }
        let variant_slot = if header[2] == 0 { None } else { Some(header[2]) };

        let upcalls = self.upcalls.clone();
        let max_bytes = self.config.max_marshal_bytes;
        let mut marshaller = Marshaller::new(server, &upcalls, max_bytes, Side::Server);
        let mut decoded = marshaller.decode_call(sig, variant_slot, words)?;

        let value = {
            let mut call = MethodCall {
                kernel: self,
                thread: tid,
                process: server.id(),
                method: sig,
                args: &mut decoded.args,
            };
            entry.object.invoke(&mut call)
        };
        let value = value?;
        marshaller.write_outputs(&decoded.outputs, &decoded.args)?;
        let word = marshaller.encode_result(sig, &decoded.ret, &decoded.args, value);
        record.temp_slots.extend(marshaller.take_new_slots());
        word
    }
}

/// Lays down the TLS image and the runtime's startup frame
///
/// The runtime entry is called as `startup(focus, 0)` with a null return
/// address; the stack it leaves behind becomes the record's top.
fn prepare_stack(server: &Process, record: &mut UpcallRecord) -> Result<(), KernelError> {
    let top = server.install_tls(record.top)?;
    record.top = top;
    record.sp = top;
    let (startup, focus) = {
        let inner = server.lock();
        (inner.startup, inner.focus)
    };
    let addr = record.push(4 * WORD_SIZE)?;
    server.write_words(addr, &[0, startup, focus, 0])?;
    record.top = addr;
    record.sp = addr;
    Ok(())
}

/// Copies output buffers the server wrote back into the client's values
fn copy_out(server: &Process, record: &UpcallRecord, args: &mut [Value]) -> Result<(), KernelError> {
    for output in &record.outputs {
        let mut bytes = vec![0u8; output.size];
        if server.read(output.server_addr, &mut bytes) != output.size {
            return Err(KernelError::MemoryFault {
                addr: output.server_addr,
            });
        }
        match args.get_mut(output.index) {
            Some(slot @ Value::Bytes(_)) => *slot = Value::Bytes(bytes),
            _ => {
                return Err(KernelError::ProtocolViolation(format!(
                    "output {} is not a buffer",
                    output.index
                )))
            }
        }
    }
    Ok(())
}
