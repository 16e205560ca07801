//! Tokenizer for the `.nnasm` dialect, built from nom combinators. Each
//! operand class implements [Parse]; [tokenize] drives them over the whole
//! file, skipping whitespace and `;` comments, and recovers from malformed
//! operands by reporting a diagnostic and resuming at the next whitespace.

use super::{
    name_to_op, DataType, Opcode, REG_FLOAT_BASE, REG_PC, REG_SF, REG_SP,
};
use crate::error::{AsmError, SourceErrorWrapper};
use crate::util::Span;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, one_of},
    combinator::{map, map_res, opt, recognize},
    error::{ErrorKind, ParseError, VerboseError},
    sequence::{pair, preceded, tuple},
    IResult, Offset, Slice,
};
use nom_locate::LocatedSpan;

pub type RawSpan<'a> = LocatedSpan<&'a str>;
type ParseResult<'a, T> =
    IResult<RawSpan<'a>, T, VerboseError<RawSpan<'a>>>;

/// A register operand: encoded index plus value type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Register {
    pub index: u8,
    pub ty: DataType,
}

/// An immediate operand; `bits` holds the raw little-endian value bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Immediate {
    pub ty: DataType,
    pub bits: u64,
}

/// Location or offset inside a memory operand.
#[derive(Clone, Debug, PartialEq)]
pub enum MemOperand {
    Reg(Register),
    Imm(Immediate),
    Ident(String),
}

/// `[loc]` or `[loc ± off]`, with an optional type suffix after the
/// bracket.
#[derive(Clone, Debug, PartialEq)]
pub struct Memory {
    pub ty: DataType,
    pub location: MemOperand,
    pub offset: Option<(bool, MemOperand)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AsmToken {
    Op(Opcode),
    Reg(Register),
    Imm(Immediate),
    Mem(Memory),
    Str(Vec<u8>),
    /// A bare identifier; a leading `~` marks a size reference
    Ident(String),
    /// `<name`: reference to a VAL alias
    ValRef(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpannedToken {
    pub token: AsmToken,
    pub span: Span,
}

/// A trait for parsing operand classes. Implementors parse exactly their
/// own text, no surrounding whitespace.
trait Parse<'a>: Sized {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self>;
}

/// `_8`, `_16s`, `_s`, `_f`, `_d` and friends; also the bare `s` that can
/// trail an integer.
fn type_suffix(input: RawSpan) -> ParseResult<'_, DataType> {
    preceded(
        char('_'),
        alt((
            map_res(
                pair(digit1, opt(char('s'))),
                |(width, signed): (RawSpan, Option<char>)| {
                    let signed = signed.is_some();
                    Ok(match (*width.fragment(), signed) {
                        ("8", false) => DataType::U8,
                        ("16", false) => DataType::U16,
                        ("32", false) => DataType::U32,
                        ("64", false) => DataType::U64,
                        ("8", true) => DataType::S8,
                        ("16", true) => DataType::S16,
                        ("32", true) => DataType::S32,
                        ("64", true) => DataType::S64,
                        _ => return Err(()),
                    })
                },
            ),
            map(char('s'), |_| DataType::S64),
            map(char('f'), |_| DataType::F32),
            map(char('d'), |_| DataType::F64),
        )),
    )(input)
}

impl<'a> Parse<'a> for Register {
    /// `$r0..$r15`, `$f0..$f15`, `$pc`, `$sf`, `$sp`, with an optional
    /// width/signedness suffix (`$r3_32s`).
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, _) = char('$')(input)?;
        let (input, reg) = alt((
            map(tag("pc"), |_| (REG_PC, DataType::U64)),
            map(tag("sf"), |_| (REG_SF, DataType::U64)),
            map(tag("sp"), |_| (REG_SP, DataType::U64)),
            map_res(
                pair(one_of("rf"), digit1),
                |(class, number): (char, RawSpan)| {
                    let number: u8 =
                        number.fragment().parse().map_err(|_| ())?;
                    if number > 15 {
                        return Err(());
                    }
                    Ok(match class {
                        'r' => (number, DataType::U64),
                        _ => (number + REG_FLOAT_BASE, DataType::F64),
                    })
                },
            ),
        ))(input)?;
        let (input, suffix) = opt(type_suffix)(input)?;
        let (index, default_ty) = reg;
        Ok((
            input,
            Register {
                index,
                ty: suffix.unwrap_or(default_ty),
            },
        ))
    }
}

impl<'a> Parse<'a> for Immediate {
    /// Decimal, hex (`0x`), octal (`0o`) and binary (`0b`) integers, and
    /// decimal floats; sign via a leading `-`, width/signedness via the
    /// usual suffixes.
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        // Radix-prefixed forms are unsigned and never floats
        let radix = |prefix: &'static str, radix: u32| {
            map_res(
                preceded(
                    tag(prefix),
                    take_while1(|c: char| c.is_ascii_alphanumeric()),
                ),
                move |digits: RawSpan| {
                    u64::from_str_radix(digits.fragment(), radix)
                        .map_err(|_| ())
                },
            )
        };
        let prefixed: ParseResult<'a, u64> =
            alt((radix("0x", 16), radix("0o", 8), radix("0b", 2)))(input);
        if let Ok((rest, bits)) = prefixed {
            let (rest, suffix) = opt(type_suffix)(rest)?;
            return Ok((
                rest,
                Immediate {
                    ty: suffix.unwrap_or(DataType::U64),
                    bits,
                },
            ));
        }

        let (rest, text) = recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        )))(input)?;
        let (rest, trailing_s) = opt(char('s'))(rest)?;
        let (rest, suffix) = opt(type_suffix)(rest)?;

        let text = *text.fragment();
        let is_float = text.contains('.')
            || matches!(suffix, Some(DataType::F32) | Some(DataType::F64));
        let imm = if is_float {
            let value: f64 = text.parse().map_err(|_| {
                nom::Err::Error(VerboseError::from_error_kind(
                    input,
                    ErrorKind::Float,
                ))
            })?;
            match suffix {
                // f32 values travel as f32 bits in the low word
                Some(DataType::F32) => Immediate {
                    ty: DataType::F32,
                    bits: u64::from((value as f32).to_bits()),
                },
                _ => Immediate {
                    ty: DataType::F64,
                    bits: value.to_bits(),
                },
            }
        } else {
            let signed = text.starts_with('-') || trailing_s.is_some();
            let bits = if text.starts_with('-') {
                let value: i64 = text.parse().map_err(|_| {
                    nom::Err::Error(VerboseError::from_error_kind(
                        input,
                        ErrorKind::Digit,
                    ))
                })?;
                value as u64
            } else {
                let value: u64 = text.parse().map_err(|_| {
                    nom::Err::Error(VerboseError::from_error_kind(
                        input,
                        ErrorKind::Digit,
                    ))
                })?;
                value
            };
            let ty = match suffix {
                Some(ty) => ty,
                None if signed => DataType::S64,
                None => DataType::U64,
            };
            Immediate { ty, bits }
        };
        Ok((rest, imm))
    }
}

fn ident_text(input: RawSpan) -> ParseResult<'_, String> {
    map(
        recognize(pair(
            take_while1(|c: char| {
                c.is_ascii_alphabetic() || c == '_' || c == '~'
            }),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
        |s: RawSpan| s.fragment().to_string(),
    )(input)
}

impl<'a> Parse<'a> for MemOperand {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((
            map(Register::parse, MemOperand::Reg),
            map(Immediate::parse, MemOperand::Imm),
            map(ident_text, MemOperand::Ident),
        ))(input)
    }
}

impl<'a> Parse<'a> for Memory {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let space = |input| take_while(|c: char| c == ' ' || c == '\t')(input);
        let (input, _) = char('[')(input)?;
        let (input, _) = space(input)?;
        let (input, location) = MemOperand::parse(input)?;
        let (input, _) = space(input)?;
        let (input, offset) = opt(tuple((
            one_of("+-"),
            space,
            MemOperand::parse,
        )))(input)?;
        let (input, _) = space(input)?;
        let (input, _) = char(']')(input)?;
        let (input, suffix) = opt(type_suffix)(input)?;
        Ok((
            input,
            Memory {
                ty: suffix.unwrap_or(DataType::U64),
                location,
                offset: offset.map(|(sign, _, op)| (sign == '-', op)),
            },
        ))
    }
}

/// `"..."` with `\n`, `\t`, `\r`, `\0` and `\\` escapes.
fn string_lit(input: RawSpan) -> ParseResult<'_, Vec<u8>> {
    let (mut rest, _) = char('"')(input)?;
    let mut bytes = Vec::new();
    loop {
        let mut chars = rest.fragment().char_indices();
        match chars.next() {
            None => {
                return Err(nom::Err::Error(VerboseError::from_error_kind(
                    rest,
                    ErrorKind::Char,
                )))
            }
            Some((_, '"')) => {
                rest = rest.slice(1..);
                break;
            }
            Some((_, '\\')) => {
                let escaped = chars.next().map(|(_, c)| c);
                let byte = match escaped {
                    Some('n') => b'\n',
                    Some('t') => b'\t',
                    Some('r') => b'\r',
                    Some('0') => 0,
                    Some(c) => {
                        let mut buf = [0u8; 4];
                        let encoded = c.encode_utf8(&mut buf);
                        bytes.extend_from_slice(&encoded.as_bytes()[..]);
                        rest = rest.slice(1 + c.len_utf8()..);
                        continue;
                    }
                    None => {
                        return Err(nom::Err::Error(
                            VerboseError::from_error_kind(
                                rest,
                                ErrorKind::Char,
                            ),
                        ))
                    }
                };
                bytes.push(byte);
                rest = rest.slice(2..);
            }
            Some((_, c)) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                rest = rest.slice(c.len_utf8()..);
            }
        }
    }
    Ok((rest, bytes))
}

impl<'a> Parse<'a> for AsmToken {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((
            map(Register::parse, AsmToken::Reg),
            map(Memory::parse, AsmToken::Mem),
            map(string_lit, AsmToken::Str),
            map(preceded(char('<'), ident_text), AsmToken::ValRef),
            map(Immediate::parse, AsmToken::Imm),
            map(ident_text, |text| {
                // Mnemonics are identifiers the opcode table knows about
                match name_to_op().get(&text.to_ascii_lowercase()) {
                    Some(&op) => AsmToken::Op(op),
                    None => AsmToken::Ident(text),
                }
            }),
        ))(input)
    }
}

/// Tokenize a whole file. Malformed operands are reported and skipped;
/// tokenization always runs to the end.
pub fn tokenize(
    src: &str,
    errors: &mut Vec<SourceErrorWrapper<AsmError>>,
) -> Vec<SpannedToken> {
    let mut tokens = Vec::new();
    let mut input = RawSpan::new(src);

    loop {
        input = skip_trivia(input);
        if input.fragment().is_empty() {
            break;
        }
        let before = input;
        match AsmToken::parse(input) {
            Ok((rest, token)) => {
                // Tokens must be separated by whitespace (or a bracket);
                // trailing garbage makes the whole word malformed
                let clean = rest
                    .fragment()
                    .chars()
                    .next()
                    .map(|c| c.is_whitespace() || c == ';')
                    .unwrap_or(true);
                if clean {
                    tokens.push(SpannedToken {
                        token,
                        span: span_between(&before, &rest),
                    });
                    input = rest;
                    continue;
                }
                input = recover(before, src, errors);
            }
            Err(_) => {
                input = recover(before, src, errors);
            }
        }
    }
    tokens
}

/// Skip whitespace and `;` line comments.
fn skip_trivia(mut input: RawSpan) -> RawSpan {
    loop {
        let fragment = input.fragment();
        let trimmed = fragment.trim_start();
        let skipped = fragment.len() - trimmed.len();
        if skipped > 0 {
            input = input.slice(skipped..);
            continue;
        }
        if trimmed.starts_with(';') {
            let line_end =
                trimmed.find('\n').unwrap_or(trimmed.len());
            input = input.slice(line_end..);
            continue;
        }
        return input;
    }
}

/// Report a malformed word and resume at the next whitespace.
fn recover<'a>(
    input: RawSpan<'a>,
    src: &str,
    errors: &mut Vec<SourceErrorWrapper<AsmError>>,
) -> RawSpan<'a> {
    let fragment = input.fragment();
    let len = fragment
        .find(char::is_whitespace)
        .unwrap_or_else(|| fragment.len());
    let span = Span {
        offset: input.location_offset(),
        length: len,
        start_line: input.location_line() as usize,
        start_col: input.get_utf8_column(),
        end_line: input.location_line() as usize,
        end_col: input.get_utf8_column() + len,
    };
    errors.push(SourceErrorWrapper::new(
        AsmError::MalformedOperand,
        span,
        src,
    ));
    input.slice(len..)
}

fn span_between(start: &RawSpan, end: &RawSpan) -> Span {
    let length = start.offset(end);
    Span {
        offset: start.location_offset(),
        length,
        start_line: start.location_line() as usize,
        start_col: start.get_utf8_column(),
        end_line: start.location_line() as usize,
        end_col: start.get_utf8_column() + length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens_of(src: &str) -> Vec<AsmToken> {
        let mut errors = Vec::new();
        let tokens = tokenize(src, &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        tokens.into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_registers() {
        assert_eq!(
            tokens_of("$r0 $r15 $pc $sf $sp $f3"),
            vec![
                AsmToken::Reg(Register { index: 0, ty: DataType::U64 }),
                AsmToken::Reg(Register { index: 15, ty: DataType::U64 }),
                AsmToken::Reg(Register { index: REG_PC, ty: DataType::U64 }),
                AsmToken::Reg(Register { index: REG_SF, ty: DataType::U64 }),
                AsmToken::Reg(Register { index: REG_SP, ty: DataType::U64 }),
                AsmToken::Reg(Register {
                    index: REG_FLOAT_BASE + 3,
                    ty: DataType::F64
                }),
            ]
        );
    }

    #[test]
    fn test_register_suffixes() {
        assert_eq!(
            tokens_of("$r3_32s $r4_8 $f1_f"),
            vec![
                AsmToken::Reg(Register { index: 3, ty: DataType::S32 }),
                AsmToken::Reg(Register { index: 4, ty: DataType::U8 }),
                AsmToken::Reg(Register {
                    index: REG_FLOAT_BASE + 1,
                    ty: DataType::F32
                }),
            ]
        );
    }

    #[test]
    fn test_bad_register_is_reported() {
        let mut errors = Vec::new();
        let tokens = tokenize("$r16 NOP", &mut errors);
        assert_eq!(errors.len(), 1);
        // Recovery continues with the next token
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token, AsmToken::Op(Opcode::NOP));
    }

    #[test]
    fn test_immediates() {
        assert_eq!(
            tokens_of("10 -3 0xFF 0b101 2.5 1.0_f 7_16 8s"),
            vec![
                AsmToken::Imm(Immediate { ty: DataType::U64, bits: 10 }),
                AsmToken::Imm(Immediate {
                    ty: DataType::S64,
                    bits: (-3i64) as u64
                }),
                AsmToken::Imm(Immediate { ty: DataType::U64, bits: 0xFF }),
                AsmToken::Imm(Immediate { ty: DataType::U64, bits: 0b101 }),
                AsmToken::Imm(Immediate {
                    ty: DataType::F64,
                    bits: 2.5f64.to_bits()
                }),
                AsmToken::Imm(Immediate {
                    ty: DataType::F32,
                    bits: u64::from(1.0f32.to_bits())
                }),
                AsmToken::Imm(Immediate { ty: DataType::U16, bits: 7 }),
                AsmToken::Imm(Immediate { ty: DataType::S64, bits: 8 }),
            ]
        );
    }

    #[test]
    fn test_memory_operands() {
        let tokens = tokens_of("[ $r1 ] [$r1 + 8] [buffer - $r2] [16]_32");
        match &tokens[0] {
            AsmToken::Mem(mem) => {
                assert_eq!(
                    mem.location,
                    MemOperand::Reg(Register { index: 1, ty: DataType::U64 })
                );
                assert!(mem.offset.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match &tokens[1] {
            AsmToken::Mem(mem) => {
                assert_eq!(
                    mem.offset,
                    Some((
                        false,
                        MemOperand::Imm(Immediate {
                            ty: DataType::U64,
                            bits: 8
                        })
                    ))
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        match &tokens[2] {
            AsmToken::Mem(mem) => {
                assert_eq!(
                    mem.location,
                    MemOperand::Ident("buffer".into())
                );
                assert!(matches!(
                    mem.offset,
                    Some((true, MemOperand::Reg(_)))
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &tokens[3] {
            AsmToken::Mem(mem) => assert_eq!(mem.ty, DataType::U32),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_idents_mnemonics_and_comments() {
        assert_eq!(
            tokens_of("LBL loop ; jump back up\nJMP loop ~buf <limit"),
            vec![
                AsmToken::Op(Opcode::LBL),
                AsmToken::Ident("loop".into()),
                AsmToken::Op(Opcode::JMP),
                AsmToken::Ident("loop".into()),
                AsmToken::Ident("~buf".into()),
                AsmToken::ValRef("limit".into()),
            ]
        );
    }

    #[test]
    fn test_strings() {
        assert_eq!(
            tokens_of(r#"DBS msg "hi\n""#),
            vec![
                AsmToken::Op(Opcode::DBS),
                AsmToken::Ident("msg".into()),
                AsmToken::Str(b"hi\n".to_vec()),
            ]
        );
    }

    #[test]
    fn test_mnemonics_case_insensitive() {
        assert_eq!(
            tokens_of("mov MOV MoV"),
            vec![
                AsmToken::Op(Opcode::MOV),
                AsmToken::Op(Opcode::MOV),
                AsmToken::Op(Opcode::MOV),
            ]
        );
    }
}
