use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use crate::backend::jit_state::MachineState;
use crate::interpreter::{Bus, Interpreter, Nmos6502Interpreter};
use crate::jit_config::{JitConfig, OptimizationFlag};
use crate::memory::{FlatMemory, MemoryAccess};
use crate::{HaltReason, Jit6502};

const PROGRAM_START: u16 = 0x1000;
const DATA_PAGE: u16 = 0x2000;
const POINTER: u8 = 0x70;
const MAX_INSNS: usize = 48;
const BUDGET: i64 = 1_000_000;

/// Program bytes for one generated step; branches only ever skip a whole 2-byte instruction.
fn insn_strategy() -> BoxedStrategy<Vec<u8>> {
    let imm_ops = prop::sample::select(vec![
        0xA9u8, 0xA2, 0xA0, 0x69, 0xE9, 0x29, 0x09, 0x49, 0xC9, 0xE0, 0xC0, 0x4B,
    ]);
    let implied = prop::sample::select(vec![
        0xE8u8, 0xC8, 0xCA, 0x88, 0xAA, 0xA8, 0x8A, 0x98, 0x18, 0x38, 0xB8, 0x0A, 0x4A, 0x2A, 0x6A,
        0xEA,
    ]);
    let zp_ops = prop::sample::select(vec![
        0xA5u8, 0x85, 0x65, 0xE5, 0xE6, 0xC6, 0x06, 0x46, 0x26, 0x66, 0x24, 0xC5, 0xB5, 0x07, 0x87,
    ]);
    let abs_ops = prop::sample::select(vec![
        0xADu8, 0x8D, 0xBD, 0xB9, 0x9D, 0x99, 0xEE, 0xCE, 0x7D, 0xFD, 0x1E, 0x3E,
    ]);
    let ind_ops = prop::sample::select(vec![0xB1u8, 0x91, 0x71, 0xF1, 0xA1]);
    let branches = prop::sample::select(vec![0x90u8, 0xB0, 0xF0, 0xD0, 0x30, 0x10, 0x50, 0x70]);

    prop_oneof![
        4 => (imm_ops, any::<u8>()).prop_map(|(op, v)| vec![op, v]),
        4 => implied.prop_map(|op| vec![op]),
        3 => (zp_ops, 0x80u8..0x90).prop_map(|(op, zp)| vec![op, zp]),
        3 => (abs_ops, any::<u8>()).prop_map(|(op, lo)| vec![op, lo & 0xF0, (DATA_PAGE >> 8) as u8]),
        2 => ind_ops.prop_map(|op| {
            let operand = if op & 0x10 != 0 { POINTER } else { POINTER.wrapping_sub(0x10) };
            vec![op, operand]
        }),
        2 => (branches, any::<u8>()).prop_map(|(op, v)| vec![op, 0x02, 0xA9, v]),
        1 => Just(vec![0x48, 0x68]),
        1 => Just(vec![0x08, 0x28]),
        1 => Just(vec![0xF8, 0x69, 0x19, 0xD8]),
    ]
    .boxed()
}

fn program_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(insn_strategy(), 1..MAX_INSNS).prop_map(|insns| {
        let mut program: Vec<u8> = insns.into_iter().flatten().collect();
        program.push(0x02);
        program
    })
}

/// A program byte whose value depends on where its step lands.
#[derive(Debug, Clone, Copy)]
enum Piece {
    Byte(u8),
    /// Low byte of the address `offset` bytes into this step.
    TargetLo(usize),
    TargetHi(usize),
}

/// A store that rewrites the immediate operand of the instruction right after it.
fn patch_strategy() -> BoxedStrategy<Vec<Piece>> {
    use Piece::{Byte, TargetHi, TargetLo};
    prop_oneof![
        // STA abs; LDA #v
        any::<u8>().prop_map(|v| vec![Byte(0x8D), TargetLo(4), TargetHi(4), Byte(0xA9), Byte(v)]),
        // LDX #0; STA abs,X; ADC #v
        any::<u8>().prop_map(|v| {
            vec![Byte(0xA2), Byte(0x00), Byte(0x9D), TargetLo(6), TargetHi(6), Byte(0x69), Byte(v)]
        }),
        // PHA; point $72 at the operand; PLA; LDY #0; STA ($72),Y; ORA #v
        any::<u8>().prop_map(|v| {
            vec![
                Byte(0x48),
                Byte(0xA9), TargetLo(15),
                Byte(0x85), Byte(0x72),
                Byte(0xA9), TargetHi(15),
                Byte(0x85), Byte(0x73),
                Byte(0x68),
                Byte(0xA0), Byte(0x00),
                Byte(0x91), Byte(0x72),
                Byte(0x09), Byte(v),
            ]
        }),
    ]
    .boxed()
}

fn self_modifying_program_strategy() -> impl Strategy<Value = Vec<u8>> {
    let step = prop_oneof![
        3 => insn_strategy().prop_map(|bytes| bytes.into_iter().map(Piece::Byte).collect()),
        1 => patch_strategy(),
    ];
    prop::collection::vec(step, 1..MAX_INSNS).prop_map(|steps| {
        let mut program = Vec::new();
        for step in steps {
            let base = PROGRAM_START + program.len() as u16;
            for piece in step {
                program.push(match piece {
                    Piece::Byte(b) => b,
                    Piece::TargetLo(offset) => (base + offset as u16) as u8,
                    Piece::TargetHi(offset) => ((base + offset as u16) >> 8) as u8,
                });
            }
        }
        program.push(0x02);
        program
    })
}

fn memory_with(program: &[u8], seed: &[u8]) -> FlatMemory {
    let mut mem = FlatMemory::new();
    mem.load(PROGRAM_START, program);
    mem.load(DATA_PAGE, seed);
    mem.load(0x0080, &seed[..16]);
    // (POINTER),Y reaches the data page; so does (POINTER-0x10,X) for small X.
    for i in 0..8u16 {
        mem.set_vector((POINTER.wrapping_sub(0x10) as u16) + i * 2, DATA_PAGE + 0x80 + i);
    }
    mem.set_vector(POINTER as u16, DATA_PAGE + 0x40);
    mem
}

struct PlainBus<'a>(&'a mut FlatMemory);

impl Bus for PlainBus<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        self.0.read(addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.0.write(addr, value)
    }
}

struct Outcome {
    state: MachineState,
    cycles: i64,
    memory: FlatMemory,
}

fn run_interpreter(mut memory: FlatMemory) -> Outcome {
    let mut state = MachineState::new();
    state.pc = PROGRAM_START;
    state.s = 0xFF;
    let mut interp = Nmos6502Interpreter::new();
    let mut cycles = 0i64;
    loop {
        let step = interp.run_one_instruction(&mut state, &mut PlainBus(&mut memory));
        cycles += step.cycles as i64;
        if step.exit.is_some() {
            break;
        }
    }
    Outcome { state, cycles, memory }
}

fn run_jit(memory: FlatMemory, config: JitConfig) -> Outcome {
    let mut jit = Jit6502::new(memory, config).unwrap();
    jit.set_s(0xFF);
    assert_eq!(jit.execute(PROGRAM_START, BUDGET).unwrap(), HaltReason::EXIT);
    let cycles = BUDGET - jit.countdown();
    let state = jit.state().clone();
    let memory = jit.into_memory();
    Outcome { state, cycles, memory }
}

/// Run in slices of `slice` cycles, resuming after every `COUNTDOWN`.
fn run_jit_sliced(memory: FlatMemory, config: JitConfig, slice: i64) -> Outcome {
    let mut jit = Jit6502::new(memory, config).unwrap();
    jit.set_s(0xFF);
    let mut given = 0i64;
    let mut pc = PROGRAM_START;
    loop {
        given += slice;
        let budget = jit.countdown() + slice;
        let reason = jit.execute(pc, budget).unwrap();
        if reason == HaltReason::EXIT {
            break;
        }
        assert_eq!(reason, HaltReason::COUNTDOWN);
        pc = jit.pc();
    }
    let cycles = given - jit.countdown();
    let state = jit.state().clone();
    let memory = jit.into_memory();
    Outcome { state, cycles, memory }
}

fn assert_same(expected: &Outcome, actual: &Outcome) -> TestCaseResult {
    let (e, a) = (&expected.state, &actual.state);
    prop_assert_eq!(e.a, a.a);
    prop_assert_eq!(e.x, a.x);
    prop_assert_eq!(e.y, a.y);
    prop_assert_eq!(e.s, a.s);
    prop_assert_eq!(e.pc, a.pc);
    prop_assert_eq!(e.flags(), a.flags());
    prop_assert_eq!(&expected.memory.as_slice()[..0x0200], &actual.memory.as_slice()[..0x0200]);
    prop_assert_eq!(
        &expected.memory.as_slice()[DATA_PAGE as usize..DATA_PAGE as usize + 0x100],
        &actual.memory.as_slice()[DATA_PAGE as usize..DATA_PAGE as usize + 0x100]
    );
    prop_assert_eq!(
        &expected.memory.as_slice()[PROGRAM_START as usize..DATA_PAGE as usize],
        &actual.memory.as_slice()[PROGRAM_START as usize..DATA_PAGE as usize]
    );
    Ok(())
}

fn config(optimizations: OptimizationFlag) -> JitConfig {
    JitConfig { optimizations, code_arena_size: 64 * 1024, ..JitConfig::default() }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_jit_matches_interpreter(
        program in program_strategy(),
        seed in prop::collection::vec(any::<u8>(), 256),
    ) {
        let expected = run_interpreter(memory_with(&program, &seed));
        let actual = run_jit(memory_with(&program, &seed), config(OptimizationFlag::ALL_OPTIMIZATIONS));
        assert_same(&expected, &actual)?;
        prop_assert_eq!(expected.cycles, actual.cycles);
    }

    #[test]
    fn test_peephole_preserves_behavior(
        program in program_strategy(),
        seed in prop::collection::vec(any::<u8>(), 256),
    ) {
        let plain = run_jit(memory_with(&program, &seed), config(OptimizationFlag::NO_OPTIMIZATIONS));
        let optimized = run_jit(memory_with(&program, &seed), config(OptimizationFlag::ALL_OPTIMIZATIONS));
        assert_same(&plain, &optimized)?;
        prop_assert_eq!(plain.cycles, optimized.cycles);
    }

    #[test]
    fn test_tiny_arena_matches_interpreter(
        program in program_strategy(),
        seed in prop::collection::vec(any::<u8>(), 256),
    ) {
        let tiny = JitConfig {
            compile_window_size: JitConfig::MIN_COMPILE_WINDOW_SIZE,
            code_arena_size: 2 * JitConfig::MIN_COMPILE_WINDOW_SIZE,
            ..JitConfig::default()
        };
        let expected = run_interpreter(memory_with(&program, &seed));
        let actual = run_jit(memory_with(&program, &seed), tiny);
        assert_same(&expected, &actual)?;
        prop_assert_eq!(expected.cycles, actual.cycles);
    }

    #[test]
    fn test_sliced_execution_matches_interpreter(
        program in program_strategy(),
        seed in prop::collection::vec(any::<u8>(), 256),
        slice in 3i64..20,
        optimize in any::<bool>(),
    ) {
        let optimizations =
            if optimize { OptimizationFlag::ALL_OPTIMIZATIONS } else { OptimizationFlag::NO_OPTIMIZATIONS };
        let expected = run_interpreter(memory_with(&program, &seed));
        let actual = run_jit_sliced(memory_with(&program, &seed), config(optimizations), slice);
        assert_same(&expected, &actual)?;
        prop_assert_eq!(expected.cycles, actual.cycles);
    }

    #[test]
    fn test_self_modifying_stores_match_interpreter(
        program in self_modifying_program_strategy(),
        seed in prop::collection::vec(any::<u8>(), 256),
        optimize in any::<bool>(),
    ) {
        let optimizations =
            if optimize { OptimizationFlag::ALL_OPTIMIZATIONS } else { OptimizationFlag::NO_OPTIMIZATIONS };
        let expected = run_interpreter(memory_with(&program, &seed));
        let actual = run_jit(memory_with(&program, &seed), config(optimizations));
        assert_same(&expected, &actual)?;
        prop_assert_eq!(expected.cycles, actual.cycles);
    }

    #[test]
    fn test_self_modifying_stores_sliced(
        program in self_modifying_program_strategy(),
        seed in prop::collection::vec(any::<u8>(), 256),
        slice in 3i64..20,
    ) {
        let expected = run_interpreter(memory_with(&program, &seed));
        let actual = run_jit_sliced(
            memory_with(&program, &seed),
            config(OptimizationFlag::ALL_OPTIMIZATIONS),
            slice,
        );
        assert_same(&expected, &actual)?;
        prop_assert_eq!(expected.cycles, actual.cycles);
    }
}

#[test]
fn test_long_block_split_across_windows() {
    // 300 x INX, then exit.
    let mut program = vec![0xE8; 300];
    program.push(0x02);
    let tiny = JitConfig {
        compile_window_size: JitConfig::MIN_COMPILE_WINDOW_SIZE,
        code_arena_size: 2 * JitConfig::MIN_COMPILE_WINDOW_SIZE,
        ..JitConfig::default()
    };
    let seed = vec![0u8; 256];
    let expected = run_interpreter(memory_with(&program, &seed));
    let mut jit = Jit6502::new(memory_with(&program, &seed), tiny).unwrap();
    jit.set_s(0xFF);
    assert_eq!(jit.execute(PROGRAM_START, BUDGET).unwrap(), HaltReason::EXIT);
    assert_eq!(jit.x(), expected.state.x);
    assert_eq!(jit.x(), 300u16 as u8);
    assert_eq!(jit.pc(), PROGRAM_START + 300);
    assert_eq!(BUDGET - jit.countdown(), 600);
    assert!(jit.compile_stats().blocks_truncated > 0);
    assert!(jit.compile_stats().arena_flushes > 0);
}
