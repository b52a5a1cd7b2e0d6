//! The assembler: sizing with branch relaxation, bank placement, byte
//! emission, and the label listing.
//!
//! Works purely over resolved symbol values; anything unresolved at this
//! point is a link error, not a guess.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::addressing::{legal_modes, AddressingMode};
use crate::assembly::AssemblyLine;
use crate::constant::Constant;
use crate::diag::CompileError;
use crate::env::Environment;
use crate::opcode::Opcode;
use crate::options::JobContext;
use crate::platform::Platform;

pub mod encoding;

pub use encoding::{decode, encode};

const RELAXATION_LIMIT: usize = 10;

#[derive(Debug)]
pub struct AssemblerOutput {
    /// Byte image per bank.
    pub code: BTreeMap<String, Vec<u8>>,
    /// The listing, one line per assembly line.
    pub asm: Vec<String>,
    /// Every symbol with its resolved address.
    pub labels: Vec<(String, u16)>,
}

/// Symbol values: environment storage plus code placement.
type Symbols = BTreeMap<String, i64>;

fn resolve_constant(constant: &Constant, symbols: &Symbols) -> Option<i64> {
    match constant {
        Constant::Numeric(value, _) => Some(*value),
        Constant::MemoryAddress(name) | Constant::Unexpanded(name, _) => {
            symbols.get(name).copied()
        }
        Constant::Subbyte(base, index) => {
            Some((resolve_constant(base, symbols)? >> (8 * index)) & 0xff)
        }
        Constant::AssertByte(inner) => {
            let value = resolve_constant(inner, symbols)?;
            (-128..=255).contains(&value).then_some(value)
        }
        Constant::Compound(op, lhs, rhs) => {
            let lhs = resolve_constant(lhs, symbols)?;
            let rhs = resolve_constant(rhs, symbols)?;
            Constant::Compound(
                *op,
                Box::new(Constant::num(lhs)),
                Box::new(Constant::num(rhs)),
            )
            .eval()
        }
    }
}

fn function_bank<'a>(env: &'a Environment, platform: &'a Platform, name: &str) -> &'a str {
    env.get(name)
        .map(|thing| thing.bank.as_str())
        .filter(|bank| platform.bank(bank).is_some())
        .unwrap_or_else(|| platform.default_bank())
}

/// Lays every function out in its bank and resolves all symbols.
fn layout(
    functions: &[(String, Vec<AssemblyLine>)],
    env: &Environment,
    platform: &Platform,
) -> Result<Symbols, CompileError> {
    let mut symbols: Symbols = BTreeMap::new();
    for thing in env.things() {
        if let Some(address) = env.address_of(&thing.name) {
            symbols.insert(thing.name.clone(), i64::from(address));
        }
    }
    let mut cursors: BTreeMap<&str, i64> = platform
        .banks
        .iter()
        .map(|bank| (bank.name.as_str(), i64::from(bank.start)))
        .collect();

    for (name, lines) in functions {
        let bank_name = function_bank(env, platform, name);
        let bank = platform
            .bank(bank_name)
            .ok_or_else(|| CompileError::Platform(format!("unknown bank `{}`", bank_name)))?;
        let cursor = cursors.get_mut(bank_name).expect("bank cursor");
        symbols.insert(name.clone(), *cursor);
        let mut address = *cursor;
        for line in lines {
            if let (true, Some(label)) = (line.is_label(), line.label_name()) {
                symbols.insert(label.to_string(), address);
            }
            address += i64::from(line.byte_size());
        }
        if address - 1 > i64::from(bank.end) {
            return Err(CompileError::Link(format!(
                "function `{}` overflows bank `{}` (${:04X} past ${:04X})",
                name, bank_name, address, bank.end
            )));
        }
        *cursor = address;
    }
    Ok(symbols)
}

/// One relaxation sweep: rewrites out-of-range branches. Returns whether
/// anything changed.
fn relax_branches(
    job: &JobContext,
    functions: &mut [(String, Vec<AssemblyLine>)],
    env: &Environment,
    platform: &Platform,
    symbols: &Symbols,
) -> bool {
    let mut changed = false;
    for (name, lines) in functions.iter_mut() {
        let bank_name = function_bank(env, platform, name);
        // The function's own placement; recompute addresses in lockstep.
        let mut address = symbols.get(name.as_str()).copied().unwrap_or_else(|| {
            platform
                .bank(bank_name)
                .map(|bank| i64::from(bank.start))
                .unwrap_or(0)
        });
        let mut rewrites: Vec<(usize, Vec<AssemblyLine>)> = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            let line_address = address;
            address += i64::from(line.byte_size());
            if line.mode != AddressingMode::Relative {
                continue;
            }
            let Some(target) = line
                .label_name()
                .and_then(|label| symbols.get(label).copied())
            else {
                continue;
            };
            let displacement = target - (line_address + 2);
            if (-128..=127).contains(&displacement) {
                continue;
            }
            debug!(
                "{}: relaxing {} to a long form (displacement {})",
                name, line.opcode, displacement
            );
            let jump = AssemblyLine::absolute(Opcode::JMP, line.operand.clone());
            let replacement = match line.opcode.inverted_branch() {
                Some(inverted) => {
                    let skip = job.labels.next("br");
                    vec![
                        AssemblyLine::relative(inverted, skip.clone()),
                        jump,
                        AssemblyLine::label(skip),
                    ]
                }
                // BRA and friends just become a plain jump.
                None => vec![jump],
            };
            rewrites.push((index, replacement));
        }
        for (index, replacement) in rewrites.into_iter().rev() {
            lines.splice(index..=index, replacement);
            changed = true;
        }
    }
    changed
}

fn operand_bytes(
    line: &AssemblyLine,
    line_address: i64,
    symbols: &Symbols,
) -> Result<Vec<u8>, CompileError> {
    let width = line.mode.operand_length();
    if width == 0 {
        return Ok(Vec::new());
    }
    let value = resolve_constant(&line.operand, symbols).ok_or_else(|| {
        CompileError::Link(format!("undefined symbol in operand `{}`", line.operand))
    })?;
    if line.mode == AddressingMode::Relative {
        let displacement = value - (line_address + 2);
        if !(-128..=127).contains(&displacement) {
            return Err(CompileError::Internal(format!(
                "unrelaxed branch to {} (displacement {})",
                line.operand, displacement
            )));
        }
        return Ok(vec![(displacement as i8) as u8]);
    }
    let mut bytes = Vec::with_capacity(usize::from(width));
    for i in 0..width {
        bytes.push(((value >> (8 * i)) & 0xff) as u8);
    }
    Ok(bytes)
}

/// Assembles the (already optimized, already reachability-filtered)
/// functions into bank images, a listing, and a label table.
pub fn assemble(
    job: &JobContext,
    mut functions: Vec<(String, Vec<AssemblyLine>)>,
    env: &Environment,
    platform: &Platform,
) -> Result<AssemblerOutput, CompileError> {
    // Sizing and relaxation to a fixpoint.
    let mut symbols = layout(&functions, env, platform)?;
    for round in 0.. {
        if round >= RELAXATION_LIMIT {
            return Err(CompileError::Internal(
                "branch relaxation did not converge".to_string(),
            ));
        }
        if !relax_branches(job, &mut functions, env, platform, &symbols) {
            break;
        }
        symbols = layout(&functions, env, platform)?;
    }

    // Emission.
    let features = job.options.features;
    let mut code: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut asm = Vec::new();
    for (name, lines) in &functions {
        let bank_name = function_bank(env, platform, name);
        let bank = platform
            .bank(bank_name)
            .ok_or_else(|| CompileError::Platform(format!("unknown bank `{}`", bank_name)))?;
        let image = code.entry(bank_name.to_string()).or_default();
        let mut address = i64::from(bank.start) + image.len() as i64;
        debug_assert_eq!(Some(&address), symbols.get(name.as_str()));
        for line in lines {
            asm.push(line.to_string());
            match line.opcode {
                Opcode::LABEL => continue,
                Opcode::BYTE => {
                    let value = resolve_constant(&line.operand, &symbols).ok_or_else(|| {
                        CompileError::Link(format!("undefined symbol in `{}`", line.operand))
                    })?;
                    image.push((value & 0xff) as u8);
                    address += 1;
                    continue;
                }
                _ => {}
            }
            if !legal_modes(line.opcode).contains(&line.mode) {
                return Err(CompileError::Internal(format!(
                    "illegal combination {} / {:?} reached the assembler",
                    line.opcode, line.mode
                )));
            }
            let opcode_byte = encode(line.opcode, line.mode, features).ok_or_else(|| {
                CompileError::Codegen(format!(
                    "{} / {:?} cannot be encoded on this CPU",
                    line.opcode, line.mode
                ))
            })?;
            image.push(opcode_byte);
            let operand = operand_bytes(line, address, &symbols)?;
            address += 1 + operand.len() as i64;
            image.extend(operand);
        }
    }

    let mut labels: Vec<(String, u16)> = symbols
        .iter()
        .map(|(name, value)| (name.clone(), (*value & 0xffff) as u16))
        .collect();
    sort_labels(&mut labels);

    let total: usize = code.values().map(Vec::len).sum();
    info!("assembled {} byte(s) across {} bank(s)", total, code.len());

    Ok(AssemblerOutput { code, asm, labels })
}

fn sort_labels(labels: &mut [(String, u16)]) {
    labels.sort_by(|(left_name, left_addr), (right_name, right_addr)| {
        left_addr
            .cmp(right_addr)
            .then_with(|| left_name.starts_with('.').cmp(&right_name.starts_with('.')))
            .then_with(|| left_name.cmp(right_name))
    });
}

/// `$` and `.` are not identifier characters in most assemblers.
pub fn normalize_name(name: &str) -> String {
    name.replace(['$', '.'], "_")
}

/// One `al <hex> .<name>` line per symbol, addresses ascending, globals
/// before locals on ties.
pub fn format_label_file(labels: &[(String, u16)]) -> String {
    let mut sorted: Vec<(String, u16)> = labels.to_vec();
    sort_labels(&mut sorted);
    let mut out = String::new();
    for (name, address) in &sorted {
        out.push_str(&format!("al {:04X} .{}\n", address, normalize_name(name)));
    }
    out
}

/// Parses a label file back into `(name, address)` pairs.
pub fn parse_label_file(text: &str) -> Vec<(String, u16)> {
    text.lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("al ")?;
            let (address, name) = rest.split_once(' ')?;
            let address = u16::from_str_radix(address, 16).ok()?;
            let name = name.strip_prefix('.')?;
            Some((name.to_string(), address))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::options::CompilationOptions;

    use super::*;

    fn job() -> JobContext {
        JobContext::new(CompilationOptions::default())
    }

    fn test_env() -> Environment {
        let mut env = Environment::new(0x02, 0xa000, 4, "default");
        env.declare_array("output", Some(256), Some(0xc000));
        env
    }

    #[test]
    fn a_tiny_function_assembles_to_the_expected_bytes() {
        let env = test_env();
        let platform = Platform::simulator();
        let functions = vec![(
            "main".to_string(),
            vec![
                AssemblyLine::label("main").pinned(),
                AssemblyLine::immediate(Opcode::LDA, 1),
                AssemblyLine::absolute(Opcode::STA, Constant::addr("output")),
                AssemblyLine::implied(Opcode::RTS),
            ],
        )];
        let output = assemble(&job(), functions, &env, &platform).unwrap();
        assert_eq!(
            output.code["default"],
            vec![0xA9, 0x01, 0x8D, 0x00, 0xC0, 0x60]
        );
        assert!(output
            .labels
            .iter()
            .any(|(name, address)| name == "main" && *address == 0x0200));
    }

    #[test]
    fn long_conditional_branches_get_relaxed() {
        let env = test_env();
        let platform = Platform::simulator();
        let mut lines = vec![
            AssemblyLine::label("main").pinned(),
            AssemblyLine::relative(Opcode::BNE, ".far"),
        ];
        for _ in 0..200 {
            lines.push(AssemblyLine::byte(Constant::num(0xea)));
        }
        lines.push(AssemblyLine::label(".far"));
        lines.push(AssemblyLine::implied(Opcode::RTS));

        let output = assemble(&job(), vec![("main".to_string(), lines)], &env, &platform).unwrap();
        let image = &output.code["default"];
        // BEQ over the JMP, then the long jump to .far.
        assert_eq!(image[0], 0xF0);
        assert_eq!(image[1], 0x03);
        assert_eq!(image[2], 0x4C);
        let target = u16::from(image[3]) | u16::from(image[4]) << 8;
        assert_eq!(target, 0x0200 + 5 + 200);
    }

    #[test]
    fn short_branches_stay_short() {
        let env = test_env();
        let platform = Platform::simulator();
        let lines = vec![
            AssemblyLine::label("main").pinned(),
            AssemblyLine::relative(Opcode::BNE, ".near"),
            AssemblyLine::byte(Constant::num(0xea)),
            AssemblyLine::label(".near"),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let output = assemble(&job(), vec![("main".to_string(), lines)], &env, &platform).unwrap();
        assert_eq!(output.code["default"], vec![0xD0, 0x01, 0xEA, 0x60]);
    }

    #[test]
    fn undefined_symbols_are_link_errors() {
        let env = test_env();
        let platform = Platform::simulator();
        let functions = vec![(
            "main".to_string(),
            vec![
                AssemblyLine::label("main").pinned(),
                AssemblyLine::absolute(Opcode::JMP, Constant::addr("nowhere")),
            ],
        )];
        let result = assemble(&job(), functions, &env, &platform);
        assert!(matches!(result, Err(CompileError::Link(_))));
    }

    #[test]
    fn bank_overflow_is_a_link_error() {
        let env = test_env();
        let mut platform = Platform::simulator();
        platform.banks[0].end = 0x0203;
        let mut lines = vec![AssemblyLine::label("main").pinned()];
        for _ in 0..8 {
            lines.push(AssemblyLine::implied(Opcode::NOP));
        }
        let result = assemble(&job(), vec![("main".to_string(), lines)], &env, &platform);
        assert!(matches!(result, Err(CompileError::Link(_))));
    }

    #[test]
    fn label_listing_round_trips() {
        let labels = vec![
            ("main".to_string(), 0x0200u16),
            (".wh_0001".to_string(), 0x0210),
            ("output".to_string(), 0xc000),
        ];
        let text = format_label_file(&labels);
        let parsed = parse_label_file(&text);
        assert_eq!(
            parsed,
            vec![
                ("main".to_string(), 0x0200),
                ("_wh_0001".to_string(), 0x0210),
                ("output".to_string(), 0xc000),
            ]
        );
        // Formatting the parsed listing reproduces it exactly.
        assert_eq!(format_label_file(&parsed), text);
    }

    #[test]
    fn globals_sort_before_locals_at_the_same_address() {
        let mut labels = vec![
            (".local".to_string(), 0x0200u16),
            ("global".to_string(), 0x0200),
        ];
        sort_labels(&mut labels);
        assert_eq!(labels[0].0, "global");
    }
}
