// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The deterministic contract bytecode machine. The instruction set exposes
//! no clock, no randomness and no I/O: every host operation is a pure
//! function of the transaction, the previous block header and the staged
//! contract contexts. Fuel is deducted per instruction; running out is a
//! recoverable error, never a panic.

use crate::consensus::Money;
use crate::contract::VmErr;
use crate::primitives::Hash160;
use bincode::{Decode, Encode};
use std::collections::HashMap;

/// Max operand stack entries per call frame
pub const STACK_SIZE: usize = 256;

/// Max locals per function
pub const MAX_LOCALS: u8 = 32;

/// Max size of a single state value
pub const MAX_STATE_VALUE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Op {
    PushInt(i64),
    PushBytes(Vec<u8>),
    PushBool(bool),
    PushNull,
    Dup,
    Drop,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Eq,
    Lt,
    Gt,
    Not,
    Jmp(u32),
    Jz(u32),
    LoadArg(u8),
    LoadLocal(u8),
    StoreLocal(u8),
    /// `[key] -> [value | null]`
    StateGet,
    /// `[key value] -> []`
    StatePut,
    Caller,
    Payment,
    SelfAddr,
    BlockHeight,
    BlockTime,
    /// `[addr] -> [balance]`
    Balance,
    /// `[dest_keyid amount] -> []`
    SendCoins,
    /// `[addr func arg...] -> [ret]`, operand is the argument count
    CallContract(u8),
    Ret,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_int(&self) -> Result<i64, VmErr> {
        match self {
            Value::Int(v) => Ok(*v),
            _ => Err(VmErr::TypeMismatch),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], VmErr> {
        match self {
            Value::Bytes(v) => Ok(v),
            _ => Err(VmErr::TypeMismatch),
        }
    }

    pub fn as_addr(&self) -> Result<Hash160, VmErr> {
        let bytes = self.as_bytes()?;
        if bytes.len() != 20 {
            return Err(VmErr::TypeMismatch);
        }
        let mut out = [0; 20];
        out.copy_from_slice(bytes);
        Ok(Hash160(out))
    }

    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Bytes(b) => !b.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FuncDef {
    pub name: String,
    pub n_locals: u8,
    pub ops: Vec<Op>,
}

/// A published contract: versioned bytecode with named entry points
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ContractCode {
    pub version: u8,
    pub funcs: Vec<FuncDef>,
}

impl ContractCode {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmErr> {
        let code: ContractCode =
            crate::codec::decode(bytes).map_err(|_| VmErr::BadCode("undecodable"))?;
        code.validate()?;
        Ok(code)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).expect("code within codec limit")
    }

    pub fn validate(&self) -> Result<(), VmErr> {
        if self.version != 1 {
            return Err(VmErr::BadCode("unknown version"));
        }
        if self.funcs.is_empty() {
            return Err(VmErr::BadCode("no entry points"));
        }
        for (i, func) in self.funcs.iter().enumerate() {
            if func.name.is_empty() {
                return Err(VmErr::BadCode("unnamed function"));
            }
            if self.funcs[..i].iter().any(|f| f.name == func.name) {
                return Err(VmErr::BadCode("duplicate function name"));
            }
            if func.n_locals > MAX_LOCALS {
                return Err(VmErr::BadCode("too many locals"));
            }
            for op in &func.ops {
                match op {
                    Op::Jmp(target) | Op::Jz(target) => {
                        if *target as usize > func.ops.len() {
                            return Err(VmErr::BadCode("jump out of range"));
                        }
                    }
                    Op::LoadLocal(idx) | Op::StoreLocal(idx) => {
                        if *idx >= func.n_locals {
                            return Err(VmErr::BadCode("local out of range"));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn find_func(&self, name: &str) -> Option<&FuncDef> {
        self.funcs.iter().find(|f| f.name == name)
    }
}

/// Message environment bound to a shell for the duration of one call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgEnv {
    pub self_addr: Hash160,
    pub sender: Hash160,
    pub payment: Money,
    pub block_height: u64,
    pub block_time: i64,
}

/// Host operations the executor provides to running code
pub trait HostCalls {
    fn internal_call(
        &mut self,
        addr: &Hash160,
        func: &str,
        args: Vec<Value>,
        fuel: &mut i64,
        depth: u32,
    ) -> Result<Value, VmErr>;

    fn send_coins(&mut self, from: &Hash160, dest_keyid: &Hash160, amount: Money)
        -> Result<(), VmErr>;

    fn get_balance(&mut self, id: &Hash160) -> Money;

    fn state_get(&mut self, addr: &Hash160, key: &[u8]) -> Option<Vec<u8>>;

    fn state_put(&mut self, addr: &Hash160, key: Vec<u8>, value: Vec<u8>) -> Result<(), VmErr>;
}

/// Execute one function to completion. `fuel` is shared across the whole
/// top-level call including internal calls; `depth` is the current
/// contract-to-contract nesting level.
pub fn run_function(
    code: &ContractCode,
    msg: &MsgEnv,
    func: &str,
    args: &[Value],
    fuel: &mut i64,
    depth: u32,
    host: &mut dyn HostCalls,
) -> Result<Value, VmErr> {
    let func = code.find_func(func).ok_or(VmErr::UnknownFunction)?;
    let mut stack: Vec<Value> = Vec::with_capacity(16);
    let mut locals: Vec<Value> = vec![Value::Null; func.n_locals as usize];
    let mut ip = 0usize;

    macro_rules! pop {
        () => {
            stack.pop().ok_or(VmErr::StackUnderflow)?
        };
    }
    macro_rules! push {
        ($val:expr) => {{
            if stack.len() >= STACK_SIZE {
                return Err(VmErr::StackOverflow);
            }
            stack.push($val);
        }};
    }

    while ip < func.ops.len() {
        *fuel -= 1;
        if *fuel < 0 {
            return Err(VmErr::OutOfFuel);
        }
        let op = &func.ops[ip];
        ip += 1;
        match op {
            Op::PushInt(v) => push!(Value::Int(*v)),
            Op::PushBytes(b) => push!(Value::Bytes(b.clone())),
            Op::PushBool(b) => push!(Value::Bool(*b)),
            Op::PushNull => push!(Value::Null),
            Op::Dup => {
                let top = stack.last().ok_or(VmErr::StackUnderflow)?.clone();
                push!(top);
            }
            Op::Drop => {
                pop!();
            }
            Op::Swap => {
                let a = pop!();
                let b = pop!();
                push!(a);
                push!(b);
            }
            Op::Add => {
                let b = pop!().as_int()?;
                let a = pop!().as_int()?;
                push!(Value::Int(a.checked_add(b).ok_or(VmErr::Overflow)?));
            }
            Op::Sub => {
                let b = pop!().as_int()?;
                let a = pop!().as_int()?;
                push!(Value::Int(a.checked_sub(b).ok_or(VmErr::Overflow)?));
            }
            Op::Mul => {
                let b = pop!().as_int()?;
                let a = pop!().as_int()?;
                push!(Value::Int(a.checked_mul(b).ok_or(VmErr::Overflow)?));
            }
            Op::Div => {
                let b = pop!().as_int()?;
                let a = pop!().as_int()?;
                push!(Value::Int(a.checked_div(b).ok_or(VmErr::DivideByZero)?));
            }
            Op::Neg => {
                let a = pop!().as_int()?;
                push!(Value::Int(a.checked_neg().ok_or(VmErr::Overflow)?));
            }
            Op::Eq => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(a == b));
            }
            Op::Lt => {
                let b = pop!().as_int()?;
                let a = pop!().as_int()?;
                push!(Value::Bool(a < b));
            }
            Op::Gt => {
                let b = pop!().as_int()?;
                let a = pop!().as_int()?;
                push!(Value::Bool(a > b));
            }
            Op::Not => {
                let a = pop!();
                push!(Value::Bool(!a.truthy()));
            }
            Op::Jmp(target) => {
                ip = *target as usize;
            }
            Op::Jz(target) => {
                let cond = pop!();
                if !cond.truthy() {
                    ip = *target as usize;
                }
            }
            Op::LoadArg(idx) => {
                let val = args.get(*idx as usize).cloned().unwrap_or(Value::Null);
                push!(val);
            }
            Op::LoadLocal(idx) => push!(locals[*idx as usize].clone()),
            Op::StoreLocal(idx) => {
                locals[*idx as usize] = pop!();
            }
            Op::StateGet => {
                let key = pop!();
                let val = host
                    .state_get(&msg.self_addr, key.as_bytes()?)
                    .map_or(Value::Null, Value::Bytes);
                push!(val);
            }
            Op::StatePut => {
                let value = pop!();
                let key = pop!();
                let value = value.as_bytes()?.to_vec();
                if value.len() > MAX_STATE_VALUE_LEN {
                    return Err(VmErr::DataTooLarge);
                }
                host.state_put(&msg.self_addr, key.as_bytes()?.to_vec(), value)?;
            }
            Op::Caller => push!(Value::Bytes(msg.sender.0.to_vec())),
            Op::Payment => push!(Value::Int(msg.payment)),
            Op::SelfAddr => push!(Value::Bytes(msg.self_addr.0.to_vec())),
            Op::BlockHeight => push!(Value::Int(msg.block_height as i64)),
            Op::BlockTime => push!(Value::Int(msg.block_time)),
            Op::Balance => {
                let addr = pop!().as_addr()?;
                push!(Value::Int(host.get_balance(&addr)));
            }
            Op::SendCoins => {
                let amount = pop!().as_int()?;
                let dest = pop!().as_addr()?;
                host.send_coins(&msg.self_addr, &dest, amount)?;
            }
            Op::CallContract(n_args) => {
                let mut call_args = vec![Value::Null; *n_args as usize];
                for slot in call_args.iter_mut().rev() {
                    *slot = pop!();
                }
                let func_name = pop!();
                let func_name =
                    String::from_utf8(func_name.as_bytes()?.to_vec()).map_err(|_| VmErr::TypeMismatch)?;
                let addr = pop!().as_addr()?;
                let ret = host.internal_call(&addr, &func_name, call_args, fuel, depth + 1)?;
                push!(ret);
            }
            Op::Ret => return Ok(stack.pop().unwrap_or(Value::Null)),
            Op::Abort => return Err(VmErr::Aborted),
        }
    }

    Ok(Value::Null)
}

/// A reusable interpreter shell. Shells are generic: [`ShellPool::acquire`]
/// loads a contract's code and message fields, `release` wipes them.
#[derive(Debug, Default)]
pub struct Shell {
    pub code: Option<ContractCode>,
    pub msg: MsgEnv,
}

impl Shell {
    fn wipe(&mut self) {
        self.code = None;
        self.msg = MsgEnv::default();
    }
}

/// Per-executor pool of interpreter shells. One shell is bound per contract
/// address while that address sits on the call stack.
#[derive(Debug, Default)]
pub struct ShellPool {
    free: Vec<Shell>,
    in_use: HashMap<Hash160, Shell>,
}

impl ShellPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a shell to `addr`. Fails if the address already holds one,
    /// which the reentrancy check rules out before calling.
    pub fn acquire(&mut self, addr: Hash160, code: ContractCode, msg: MsgEnv) -> Result<(), VmErr> {
        if self.in_use.contains_key(&addr) {
            return Err(VmErr::Reentrancy);
        }
        let mut shell = self.free.pop().unwrap_or_default();
        shell.code = Some(code);
        shell.msg = msg;
        self.in_use.insert(addr, shell);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, addr: &Hash160) -> Option<&Shell> {
        self.in_use.get(addr)
    }

    /// Wipe the shell's message fields and return it to the free queue.
    /// Callers run this on every exit path, abort included.
    pub fn release(&mut self, addr: &Hash160) {
        if let Some(mut shell) = self.in_use.remove(addr) {
            shell.wipe();
            self.free.push(shell);
        }
    }

    #[must_use]
    pub fn in_use_len(&self) -> usize {
        self.in_use.len()
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct NullHost {
        state: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl HostCalls for NullHost {
        fn internal_call(
            &mut self,
            _addr: &Hash160,
            _func: &str,
            _args: Vec<Value>,
            _fuel: &mut i64,
            _depth: u32,
        ) -> Result<Value, VmErr> {
            Ok(Value::Null)
        }
        fn send_coins(&mut self, _: &Hash160, _: &Hash160, _: Money) -> Result<(), VmErr> {
            Ok(())
        }
        fn get_balance(&mut self, _: &Hash160) -> Money {
            0
        }
        fn state_get(&mut self, _: &Hash160, key: &[u8]) -> Option<Vec<u8>> {
            self.state.get(key).cloned()
        }
        fn state_put(&mut self, _: &Hash160, key: Vec<u8>, value: Vec<u8>) -> Result<(), VmErr> {
            self.state.insert(key, value);
            Ok(())
        }
    }

    fn run(ops: Vec<Op>, args: &[Value], fuel: i64) -> Result<Value, VmErr> {
        let code = ContractCode {
            version: 1,
            funcs: vec![FuncDef {
                name: "main".into(),
                n_locals: 4,
                ops,
            }],
        };
        code.validate().unwrap();
        let mut host = NullHost {
            state: BTreeMap::new(),
        };
        let mut fuel = fuel;
        run_function(
            &code,
            &MsgEnv::default(),
            "main",
            args,
            &mut fuel,
            0,
            &mut host,
        )
    }

    #[test]
    fn arithmetic_and_return() {
        let ops = vec![Op::PushInt(2), Op::PushInt(3), Op::Mul, Op::Ret];
        assert_eq!(run(ops, &[], 100), Ok(Value::Int(6)));
    }

    #[test]
    fn out_of_fuel_is_an_error_not_a_panic() {
        let ops = vec![Op::Jmp(0)];
        assert_eq!(run(ops, &[], 1000), Err(VmErr::OutOfFuel));
    }

    #[test]
    fn state_round_trip() {
        let ops = vec![
            Op::PushBytes(b"k".to_vec()),
            Op::PushBytes(b"v".to_vec()),
            Op::StatePut,
            Op::PushBytes(b"k".to_vec()),
            Op::StateGet,
            Op::Ret,
        ];
        assert_eq!(run(ops, &[], 100), Ok(Value::Bytes(b"v".to_vec())));
    }

    #[test]
    fn division_by_zero_aborts_cleanly() {
        let ops = vec![Op::PushInt(1), Op::PushInt(0), Op::Div, Op::Ret];
        assert_eq!(run(ops, &[], 100), Err(VmErr::DivideByZero));
    }

    #[test]
    fn code_validation_rejects_bad_jumps() {
        let code = ContractCode {
            version: 1,
            funcs: vec![FuncDef {
                name: "main".into(),
                n_locals: 0,
                ops: vec![Op::Jmp(9)],
            }],
        };
        assert_eq!(code.validate(), Err(VmErr::BadCode("jump out of range")));
    }

    #[test]
    fn shell_pool_recycles() {
        let mut pool = ShellPool::new();
        let addr = Hash160::hash_from_slice(b"c");
        let code = ContractCode {
            version: 1,
            funcs: vec![FuncDef {
                name: "f".into(),
                n_locals: 0,
                ops: vec![Op::Ret],
            }],
        };
        pool.acquire(addr, code.clone(), MsgEnv::default()).unwrap();
        assert!(pool.acquire(addr, code, MsgEnv::default()).is_err());
        pool.release(&addr);
        assert_eq!(pool.in_use_len(), 0);
        assert_eq!(pool.free_len(), 1);
        assert!(pool.get(&addr).is_none());
    }
}
