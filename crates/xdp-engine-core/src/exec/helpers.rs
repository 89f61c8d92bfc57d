// SPDX-License-Identifier: GPL-2.0

//! Runtime helper implementations
//!
//! Arguments arrive in r1..r5 and the result goes to r0. Map helpers go
//! through the same byte-level map API as the control plane; failures are
//! reported to the program as negative errno values.

use crate::core::error::{ExecutionError, MapError};
use crate::core::hash::hash_bytes;
use crate::core::types::*;
use crate::maps::{Map, UpdateMode};

use super::interpreter::Interpreter;
use super::memory::{untag, REGION_MAP_HANDLE};

type Result<T> = std::result::Result<T, ExecutionError>;

const EINVAL: i64 = -22;

fn errno(r: std::result::Result<(), MapError>) -> u64 {
    match r {
        Ok(()) => 0,
        Err(e) => e.errno() as u64,
    }
}

impl<'m, 'p> Interpreter<'m, 'p> {
    fn map_arg(&self, pc: usize, addr: u64) -> Result<&'p Map> {
        let maps: &'p [std::sync::Arc<Map>] = self.maps;
        let (region, idx) = untag(addr);
        if region != REGION_MAP_HANDLE {
            return Err(ExecutionError::RuntimeBoundsViolation { insn_idx: pc, addr, size: 0 });
        }
        maps.get(idx as usize)
            .map(|m| &**m)
            .ok_or(ExecutionError::RuntimeBoundsViolation { insn_idx: pc, addr, size: 0 })
    }

    fn arg(&self, n: usize) -> u64 {
        self.regs[REG_1 + n]
    }

    /// Call helper `id`; returns the new r0. Caller-saved argument registers
    /// keep their values at run time, which is safe since the verifier treats
    /// them as clobbered.
    pub(super) fn call_helper(&mut self, pc: usize, id: i32) -> Result<u64> {
        let disallowed = ExecutionError::DisallowedCall { insn_idx: pc, helper: id };
        let Some(helper) = Helper::from_id(id) else {
            return Err(disallowed);
        };
        Ok(match helper {
            Helper::MapLookupElem => {
                let map = self.map_arg(pc, self.arg(0))?;
                let key = self.mem.read_bytes(pc, self.arg(1), map.schema().key_size as usize)?;
                match map.lookup_cell(&key, self.worker) {
                    Ok(Some(cell)) => self.mem.map_value(cell).unwrap_or(0),
                    _ => 0,
                }
            }
            Helper::MapUpdateElem => {
                let map = self.map_arg(pc, self.arg(0))?;
                let schema = *map.schema();
                let key = self.mem.read_bytes(pc, self.arg(1), schema.key_size as usize)?;
                let value = self.mem.read_bytes(pc, self.arg(2), schema.value_size as usize)?;
                match UpdateMode::from_flags(self.arg(3)) {
                    Some(mode) => errno(map.update_from_worker(&key, &value, mode, self.worker)),
                    None => EINVAL as u64,
                }
            }
            Helper::MapDeleteElem => {
                let map = self.map_arg(pc, self.arg(0))?;
                let key = self.mem.read_bytes(pc, self.arg(1), map.schema().key_size as usize)?;
                errno(map.delete(&key))
            }
            Helper::KtimeGetNs => self.clock.now_ns(),
            Helper::Redirect => {
                if !self.attach.allows_redirect() {
                    return Err(disallowed);
                }
                if self.arg(1) != 0 {
                    XDP_ABORTED
                } else {
                    self.redirect = Some(self.arg(0) as u32);
                    XDP_REDIRECT
                }
            }
            Helper::HashBytes => {
                let len = self.arg(1);
                if len == 0 || len > HASH_BYTES_MAX {
                    return Err(ExecutionError::RuntimeBoundsViolation {
                        insn_idx: pc,
                        addr: self.arg(0),
                        size: len as usize,
                    });
                }
                let data = self.mem.read_bytes(pc, self.arg(0), len as usize)?;
                u64::from(hash_bytes(&data))
            }
            Helper::RingbufOutput => {
                let map = self.map_arg(pc, self.arg(0))?;
                let Some(ring) = map.as_ringbuf() else {
                    return Err(disallowed);
                };
                let data = self.mem.read_bytes(pc, self.arg(1), self.arg(2) as usize)?;
                errno(ring.output(&data))
            }
            Helper::RingbufReserve => {
                let map = self.map_arg(pc, self.arg(0))?;
                let Some(ring) = map.as_ringbuf() else {
                    return Err(disallowed);
                };
                let size = usize::try_from(self.arg(1)).unwrap_or(usize::MAX);
                match ring.reserve(size) {
                    Some(rec) => self.mem.reserve(rec).unwrap_or(0),
                    None => 0,
                }
            }
            Helper::RingbufSubmit | Helper::RingbufDiscard => {
                let addr = self.arg(0);
                let Some(rec) = self.mem.release(addr) else {
                    return Err(ExecutionError::RuntimeBoundsViolation { insn_idx: pc, addr, size: 0 });
                };
                if helper == Helper::RingbufSubmit {
                    rec.submit();
                } else {
                    rec.discard();
                }
                0
            }
            Helper::GetWorkerId => self.worker as u64,
        })
    }
}
