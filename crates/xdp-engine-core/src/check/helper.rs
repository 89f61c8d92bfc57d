// SPDX-License-Identifier: GPL-2.0

//! Helper call verification
//!
//! Each helper has a fixed prototype: the kinds of its arguments in r1..r5
//! and the type it returns in r0. Memory arguments are checked for
//! readability over their full size; map arguments select the key and value
//! sizes the memory arguments must cover.

use super::src_reg;
use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Result};
use crate::core::log::log_call;
use crate::core::types::*;
use crate::maps::{MapKind, MapSchema};
use crate::mem::{check_mem_region, check_packet_access};
use crate::state::reg_state::RegState;
use crate::verifier::env::VerifierEnv;

use super::load_store::stack_error;

/// Argument kinds of helper prototypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Not used
    DontCare,
    /// Map handle
    ConstMapPtr,
    /// Memory of the map's key size
    MapKey,
    /// Memory of the map's value size
    MapValue,
    /// Readable memory, size in the next argument
    Mem,
    /// Constant size of the previous memory argument
    ConstSize,
    /// Any scalar
    Anything,
    /// Update flags, constant in 0..=2 when known
    UpdateFlags,
    /// Must be scalar zero
    Zero,
    /// Non-NULL ring buffer record holding a reference
    RingbufRecord,
}

/// What a helper returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetType {
    /// Any 64-bit scalar
    Integer,
    /// 32-bit scalar
    Integer32,
    /// Verdict code of a redirect
    RedirectVerdict,
    /// Map value or NULL
    MapValueOrNull,
    /// Ring buffer record or NULL; acquires a reference
    RingbufOrNull,
    /// Always zero
    Void,
}

/// Prototype of a helper
#[derive(Debug, Clone, Copy)]
pub struct HelperProto {
    /// Arguments r1..r5
    pub args: [ArgType; 5],
    /// Return type
    pub ret: RetType,
    /// Map kinds accepted by a `ConstMapPtr` argument
    pub map_kinds: &'static [MapKind],
}

const KEYED: &[MapKind] = &[MapKind::Hash, MapKind::LruHash, MapKind::Array, MapKind::PerWorkerArray];
const DELETABLE: &[MapKind] = &[MapKind::Hash, MapKind::LruHash];
const RINGBUF: &[MapKind] = &[MapKind::RingBuffer];

impl HelperProto {
    const fn new(args: [ArgType; 5], ret: RetType, map_kinds: &'static [MapKind]) -> Self {
        Self { args, ret, map_kinds }
    }
}

/// Prototype of `helper`
pub fn helper_proto(helper: Helper) -> HelperProto {
    use ArgType::*;
    match helper {
        Helper::MapLookupElem => HelperProto::new(
            [ConstMapPtr, MapKey, DontCare, DontCare, DontCare],
            RetType::MapValueOrNull,
            KEYED,
        ),
        Helper::MapUpdateElem => HelperProto::new(
            [ConstMapPtr, MapKey, MapValue, UpdateFlags, DontCare],
            RetType::Integer,
            KEYED,
        ),
        Helper::MapDeleteElem => HelperProto::new(
            [ConstMapPtr, MapKey, DontCare, DontCare, DontCare],
            RetType::Integer,
            DELETABLE,
        ),
        Helper::KtimeGetNs => HelperProto::new([DontCare; 5], RetType::Integer, &[]),
        Helper::Redirect => HelperProto::new(
            [Anything, Zero, DontCare, DontCare, DontCare],
            RetType::RedirectVerdict,
            &[],
        ),
        Helper::HashBytes => HelperProto::new(
            [Mem, ConstSize, DontCare, DontCare, DontCare],
            RetType::Integer32,
            &[],
        ),
        Helper::RingbufOutput => HelperProto::new(
            [ConstMapPtr, Mem, ConstSize, Anything, DontCare],
            RetType::Integer,
            RINGBUF,
        ),
        Helper::RingbufReserve => HelperProto::new(
            [ConstMapPtr, ConstSize, Anything, DontCare, DontCare],
            RetType::RingbufOrNull,
            RINGBUF,
        ),
        Helper::RingbufSubmit | Helper::RingbufDiscard => HelperProto::new(
            [RingbufRecord, Anything, DontCare, DontCare, DontCare],
            RetType::Void,
            &[],
        ),
        Helper::GetWorkerId => HelperProto::new([DontCare; 5], RetType::Integer32, &[]),
    }
}

/// Largest size a `ConstSize` argument may take for `helper`
fn max_const_size(helper: Helper, map: Option<&MapSchema>) -> u64 {
    match helper {
        Helper::HashBytes => HASH_BYTES_MAX,
        _ => map.map_or(0, |m| u64::from(m.value_size)),
    }
}

/// Check that `size` bytes behind `reg` may be read by a helper
fn check_helper_mem_access(
    env: &VerifierEnv<'_>,
    insn_idx: usize,
    regno: usize,
    reg: &RegState,
    size: usize,
) -> Result<()> {
    if reg.maybe_null() {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "R{} type={}_or_null expected=mem",
            regno,
            reg.reg_type.name()
        ));
    }
    match reg.reg_type {
        RegType::PtrToStack => env
            .cur_state
            .stack
            .check_readable(reg.off, size)
            .map_err(|e| stack_error(insn_idx, reg.off, size, e)),
        RegType::PtrToPacket => check_packet_access(insn_idx, reg, 0, size),
        RegType::PtrToMapValue => {
            let Some(schema) = env.map_schema(reg.map_idx) else {
                return Err(reject!(insn_idx, MapSchemaMismatch, "no map at index {}", reg.map_idx));
            };
            check_mem_region(insn_idx, reg, 0, size, schema.value_size)
        }
        RegType::PtrToRingbufRecord => check_mem_region(insn_idx, reg, 0, size, reg.mem_size),
        other => Err(reject!(
            insn_idx,
            TypeMismatch,
            "R{} type={} expected=mem",
            regno,
            other.name()
        )),
    }
}

/// Check a helper call and apply its effects on the state
pub fn check_helper_call(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let Some(helper) = Helper::from_id(insn.imm) else {
        return Err(reject!(insn_idx, DisallowedCall, "invalid func unknown#{}", insn.imm));
    };
    if helper == Helper::Redirect && !env.attach.allows_redirect() {
        return Err(reject!(
            insn_idx,
            DisallowedCall,
            "helper {} is not allowed in {} programs",
            helper.name(),
            env.attach
        ));
    }
    log_call(&mut env.log, insn_idx, helper);
    env.stats.helper_calls += 1;

    let proto = helper_proto(helper);
    let mut map: Option<(u32, MapSchema)> = None;
    let mut mem_arg: Option<(usize, RegState)> = None;
    let mut const_size: Option<u64> = None;
    let mut record_ref = 0u32;

    for (i, arg) in proto.args.iter().enumerate() {
        let regno = REG_1 + i;
        if *arg == ArgType::DontCare {
            continue;
        }
        let reg = src_reg(&env.cur_state, insn_idx, regno as u8)?;
        match arg {
            ArgType::DontCare => {}
            ArgType::ConstMapPtr => {
                if reg.reg_type != RegType::ConstPtrToMap {
                    return Err(reject!(
                        insn_idx,
                        TypeMismatch,
                        "R{} type={} expected=map_ptr",
                        regno,
                        reg.reg_type.name()
                    ));
                }
                let Some(schema) = env.map_schema(reg.map_idx).copied() else {
                    return Err(reject!(insn_idx, MapSchemaMismatch, "no map at index {}", reg.map_idx));
                };
                if !proto.map_kinds.contains(&schema.kind) {
                    return Err(reject!(
                        insn_idx,
                        TypeMismatch,
                        "cannot pass {} map to {}",
                        schema.kind,
                        helper.name()
                    ));
                }
                map = Some((reg.map_idx, schema));
            }
            ArgType::MapKey | ArgType::MapValue => {
                let Some((_, schema)) = map else {
                    return Err(reject!(insn_idx, TypeMismatch, "R{} map argument missing", regno));
                };
                let size = if *arg == ArgType::MapKey {
                    schema.key_size
                } else {
                    schema.value_size
                };
                check_helper_mem_access(env, insn_idx, regno, &reg, size as usize)?;
            }
            ArgType::Mem => mem_arg = Some((regno, reg)),
            ArgType::ConstSize => {
                let max = max_const_size(helper, map.as_ref().map(|(_, s)| s));
                let n = match reg.const_value() {
                    Some(n) if (1..=max).contains(&n) => n,
                    Some(n) => {
                        return Err(reject!(
                            insn_idx,
                            TypeMismatch,
                            "R{} size {} not in [1, {}] for {}",
                            regno,
                            n,
                            max,
                            helper.name()
                        ))
                    }
                    None => {
                        return Err(reject!(
                            insn_idx,
                            TypeMismatch,
                            "R{} size argument of {} must be a constant",
                            regno,
                            helper.name()
                        ))
                    }
                };
                const_size = Some(n);
                if let Some((mem_regno, mem)) = mem_arg {
                    check_helper_mem_access(env, insn_idx, mem_regno, &mem, n as usize)?;
                }
            }
            ArgType::Anything => {
                if !reg.is_scalar() {
                    return Err(reject!(
                        insn_idx,
                        TypeMismatch,
                        "R{} type={} expected=scalar",
                        regno,
                        reg.reg_type.name()
                    ));
                }
            }
            ArgType::UpdateFlags => {
                let ok = reg.is_scalar() && reg.const_value().map_or(true, |f| f <= BPF_EXIST);
                if !ok {
                    return Err(reject!(insn_idx, TypeMismatch, "R{} invalid update flags", regno));
                }
            }
            ArgType::Zero => {
                if reg.const_value() != Some(0) {
                    return Err(reject!(insn_idx, TypeMismatch, "R{} flags must be 0", regno));
                }
            }
            ArgType::RingbufRecord => {
                let valid = reg.reg_type == RegType::PtrToRingbufRecord
                    && !reg.maybe_null()
                    && reg.ref_obj_id != 0
                    && reg.off == 0
                    && reg.bounds.const_value() == Some(0);
                if !valid {
                    return Err(reject!(
                        insn_idx,
                        TypeMismatch,
                        "R{} type={} expected=ringbuf_mem at offset 0",
                        regno,
                        reg.reg_type.name()
                    ));
                }
                record_ref = reg.ref_obj_id;
            }
        }
    }

    if record_ref != 0 && !env.cur_state.release_ref(record_ref) {
        return Err(reject!(
            insn_idx,
            UnreleasedReference,
            "reference {} released twice",
            record_ref
        ));
    }

    let r0 = match proto.ret {
        RetType::Integer => RegState::unknown_scalar(),
        RetType::Integer32 => RegState::scalar(ScalarBounds::of_width(4)),
        RetType::RedirectVerdict => RegState::scalar(ScalarBounds::from_range(XDP_ABORTED, XDP_REDIRECT)),
        RetType::Void => RegState::known(0),
        RetType::MapValueOrNull => {
            let map_idx = map.map_or(0, |(idx, _)| idx);
            let id = env.new_id();
            RegState::map_value_or_null(map_idx, id)
        }
        RetType::RingbufOrNull => {
            let id = env.new_id();
            env.cur_state.acquire_ref(id);
            RegState::ringbuf_or_null(const_size.unwrap_or(0) as u32, id)
        }
    };
    env.cur_state.clobber_caller_saved();
    env.cur_state.regs[REG_0] = r0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_helper_has_proto() {
        for h in Helper::ALL {
            let p = helper_proto(h);
            let uses_map = p.args.contains(&ArgType::ConstMapPtr);
            assert_eq!(uses_map, !p.map_kinds.is_empty(), "{}", h.name());
        }
    }

    #[test]
    fn test_delete_only_on_hashes() {
        let p = helper_proto(Helper::MapDeleteElem);
        assert!(p.map_kinds.contains(&MapKind::LruHash));
        assert!(!p.map_kinds.contains(&MapKind::Array));
    }
}
