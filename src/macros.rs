//! `.define` and `.macro` definitions and call-site expansion.

use std::collections::HashMap;

use crate::token::{self, SourceInfo, Token, TokenKind};
use crate::{Error, Result};

/// A parsed macro body.  The first line of the definition names the
/// parameters; the production is every line up to (not including) the
/// matching `.endmacro`.  Nested macro definitions are not allowed.
pub struct Macro {
    params: Vec<String>,
    production: Vec<Vec<Token>>,
}

impl Macro {
    /// `line` is the full `.macro name [params]` line.
    pub fn define(line: &[Token], production: Vec<Vec<Token>>) -> Result<Macro> {
        token::expect_identifier(line.get(1), line.first())?;
        let params = token::idents_from_clist(&line[2..])?;
        Ok(Macro { params, production })
    }

    /// Expands a call line.  Arguments are split on top-level commas
    /// with curly groups kept intact (a lone group unwraps one layer);
    /// missing arguments expand to nothing.
    pub fn expand(&self, tokens: &[Token], id_gen: &mut usize) -> Result<Vec<Vec<Token>>> {
        let mut i = 1; // start looking after the macro ident
        let mut replacements: HashMap<&str, Vec<Token>> = HashMap::new();
        for param in &self.params {
            let comma = token::find_comma(tokens, i);
            let mut slice = tokens.get(i..comma).map(<[Token]>::to_vec).unwrap_or_default();
            i = comma + 1;
            if slice.len() == 1 {
                if let TokenKind::Grp(inner) = &slice[0].kind {
                    slice = inner.clone();
                }
            }
            replacements.insert(param, slice);
        }
        if i < tokens.len() {
            return Err(Error::Syntax(format!(
                "Too many macro parameters: {}",
                token::name_at(tokens.get(i))
            )));
        }
        let call_source = tokens.first().and_then(|t| t.source.clone());
        let mut locals: HashMap<String, String> = HashMap::new();
        let mut lines = Vec::new();
        for line in &self.production {
            if line.first().map_or(false, |t| t.is_cs(".local")) {
                for local in token::idents_from_clist(&line[1..])? {
                    // a name that is impossible to type, thanks to the '@'
                    let renamed = format!("{local}@{id_gen}");
                    *id_gen += 1;
                    locals.insert(local, renamed);
                }
            }
            let mapped = map_line(line, &replacements, &locals, call_source.as_ref());
            if !mapped.is_empty() {
                lines.push(mapped);
            }
        }
        Ok(lines)
    }
}

/// One element of a TeX-style `.define` pattern.
#[derive(Clone, Debug)]
enum Pat {
    /// Captures tokens into the named parameter.
    Param(String),
    /// Must match a literal token at the call site.
    Delim(Token),
    /// Matches the end of the call line.
    Eol,
}

#[derive(Clone, Debug)]
enum Params {
    /// `.define foo production` — no parameters at all.
    None,
    /// `.define foo(a, b) production` — comma-separated call arguments,
    /// with or without parens at the call site.
    CStyle(Vec<String>),
    /// `.define foo {a, b .eol} production` — pattern-matched call.
    TexStyle(Vec<Pat>),
}

#[derive(Clone, Debug)]
struct Overload {
    params: Params,
    production: Vec<Token>,
}

/// A `.define` expansion: one or more overloads tried in definition
/// order.  Unlike a [`Macro`], a define rewrites tokens in the middle
/// of a line; `.eol` in the production spills extra lines.
#[derive(Clone, Debug)]
pub struct Define {
    overloads: Vec<Overload>,
}

impl Define {
    /// `line` is the full `.define name ...` line.
    pub fn define(line: &[Token]) -> Result<Define> {
        token::expect_identifier(line.get(1), line.first())?;
        let overload = match line.get(2).map(|t| &t.kind) {
            Some(TokenKind::Grp(pattern)) => Overload {
                params: Params::TexStyle(
                    pattern
                        .iter()
                        .map(|t| match &t.kind {
                            TokenKind::Ident(name) => Pat::Param(name.clone()),
                            TokenKind::Cs { name, .. } if name == ".eol" => Pat::Eol,
                            _ => Pat::Delim(t.clone()),
                        })
                        .collect(),
                ),
                production: line[3..].to_vec(),
            },
            Some(TokenKind::LParen) => match c_style_params(line) {
                Some((params, production)) => Overload {
                    params: Params::CStyle(params),
                    production,
                },
                // parens that do not read as a parameter list start
                // the production of a no-parameter define
                None => Overload {
                    params: Params::None,
                    production: line[2..].to_vec(),
                },
            },
            _ => Overload {
                params: Params::None,
                production: line[2..].to_vec(),
            },
        };
        Ok(Define {
            overloads: vec![overload],
        })
    }

    /// A later `.define` of the same name adds an overload; call sites
    /// try them in definition order.
    pub fn append(&mut self, other: Define) {
        self.overloads.extend(other.overloads);
    }

    /// Expands the define call at `line[pos]` in place.  `None` means
    /// no overload matched and the token stays as written.  On a match
    /// the replaced production may spill extra lines (`.eol`), which
    /// the caller pushes back onto the stream.
    pub fn expand(&self, line: &mut Vec<Token>, pos: usize) -> Option<Vec<Vec<Token>>> {
        for overload in &self.overloads {
            let Some((end, args)) = overload.match_call(line, pos) else {
                continue;
            };
            let mut produced = overload.produce(&args, line[pos].source.as_ref());
            // a multi-line production cannot splice mid-line
            if produced.len() > 1 && end < line.len() {
                continue;
            }
            let first = if produced.is_empty() {
                Vec::new()
            } else {
                produced.remove(0)
            };
            line.splice(pos..end, first);
            return Some(produced);
        }
        None
    }
}

impl Overload {
    /// Matches the call at `line[pos]`, returning the index just past
    /// the consumed tokens and the captured arguments.
    fn match_call(&self, line: &[Token], pos: usize) -> Option<(usize, HashMap<&str, Vec<Token>>)> {
        let mut args: HashMap<&str, Vec<Token>> = HashMap::new();
        match &self.params {
            Params::None => Some((pos + 1, args)),
            Params::CStyle(params) => {
                if line.get(pos + 1).map_or(false, |t| t.kind == TokenKind::LParen) {
                    let close = token::find_balanced(line, pos + 1)?;
                    let pieces = token::parse_arg_list(line, pos + 2, close).ok()?;
                    // foo() is one blank argument, not zero
                    if pieces.len() > params.len() {
                        return None;
                    }
                    for (k, param) in params.iter().enumerate() {
                        let arg = pieces.get(k).cloned().unwrap_or_default();
                        args.insert(param, unwrap_group(arg));
                    }
                    Some((close + 1, args))
                } else {
                    let mut i = pos + 1;
                    for (k, param) in params.iter().enumerate() {
                        let arg = if k + 1 == params.len() {
                            // the last parameter globs to end of line
                            let arg = line.get(i..).unwrap_or_default().to_vec();
                            i = line.len();
                            arg
                        } else {
                            let comma = token::find_comma(line, i);
                            let arg = line.get(i..comma).unwrap_or_default().to_vec();
                            i = (comma + 1).min(line.len());
                            arg
                        };
                        args.insert(param, unwrap_group(arg));
                    }
                    Some((line.len(), args))
                }
            }
            Params::TexStyle(pattern) => {
                let mut i = pos + 1;
                let mut k = 0;
                while k < pattern.len() {
                    match &pattern[k] {
                        Pat::Param(name) => match pattern.get(k + 1) {
                            Some(Pat::Delim(delim)) => {
                                let mut j = i;
                                while j < line.len() && !line[j].matches(delim) {
                                    j += 1;
                                }
                                if j == line.len() {
                                    return None;
                                }
                                // delimited captures keep their braces
                                args.insert(name, line[i..j].to_vec());
                                i = j + 1;
                                k += 2;
                            }
                            Some(Pat::Eol) => {
                                args.insert(name, line.get(i..).unwrap_or_default().to_vec());
                                i = line.len();
                                k += 2;
                            }
                            _ => {
                                // undelimited: exactly one token, a
                                // whole group unwraps
                                let tok = line.get(i)?;
                                let arg = match &tok.kind {
                                    TokenKind::Grp(inner) => inner.clone(),
                                    _ => vec![tok.clone()],
                                };
                                args.insert(name, arg);
                                i += 1;
                                k += 1;
                            }
                        },
                        Pat::Delim(delim) => {
                            if !line.get(i).map_or(false, |t| t.matches(delim)) {
                                return None;
                            }
                            i += 1;
                            k += 1;
                        }
                        Pat::Eol => {
                            if i != line.len() {
                                return None;
                            }
                            k += 1;
                        }
                    }
                }
                Some((i, args))
            }
        }
    }

    /// Substitutes arguments into the production and splits it into
    /// lines at top-level `.eol` markers.
    fn produce(
        &self,
        args: &HashMap<&str, Vec<Token>>,
        call: Option<&SourceInfo>,
    ) -> Vec<Vec<Token>> {
        let locals = HashMap::new();
        self.production
            .split(|t| t.is_cs(".eol"))
            .map(|part| map_line(part, args, &locals, call))
            .collect()
    }
}

/// Parses `(a, b, c)` after the define name.  `None` when the parens
/// do not contain a plain identifier list.
fn c_style_params(line: &[Token]) -> Option<(Vec<String>, Vec<Token>)> {
    let close = token::find_balanced(line, 2)?;
    let params = token::idents_from_clist(&line[3..close]).ok()?;
    Some((params, line[close + 1..].to_vec()))
}

fn unwrap_group(arg: Vec<Token>) -> Vec<Token> {
    if arg.len() == 1 {
        if let TokenKind::Grp(inner) = &arg[0].kind {
            return inner.clone();
        }
    }
    arg
}

fn map_line(
    toks: &[Token],
    replacements: &HashMap<&str, Vec<Token>>,
    locals: &HashMap<String, String>,
    call: Option<&SourceInfo>,
) -> Vec<Token> {
    let mut mapped: Vec<Token> = Vec::new();
    for tok in toks {
        // the rest of the line declares local variables
        if tok.is_cs(".local") {
            return mapped;
        }
        match &tok.kind {
            TokenKind::Ident(name) => {
                if let Some(param) = replacements.get(name.as_str()) {
                    mapped.extend(param.iter().cloned());
                    continue;
                }
                if let Some(local) = locals.get(name) {
                    mapped.push(Token::ident(local));
                    continue;
                }
            }
            TokenKind::Grp(inner) => {
                mapped.push(Token::new(TokenKind::Grp(map_line(
                    inner,
                    replacements,
                    locals,
                    call,
                ))));
                continue;
            }
            _ => {}
        }
        let source = match (&tok.source, call) {
            (Some(s), Some(c)) => Some(SourceInfo {
                parent: Some(Box::new(c.clone())),
                ..s.clone()
            }),
            (Some(s), None) => Some(s.clone()),
            (None, c) => c.cloned(),
        };
        mapped.push(Token {
            kind: tok.kind.clone(),
            source,
        });
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::Tokenizer;

    fn lines(text: &str) -> Vec<Vec<Token>> {
        let mut t = Tokenizer::new(text, "mac.s");
        let mut out = Vec::new();
        while let Some(line) = t.next_line().unwrap() {
            out.push(line);
        }
        out
    }

    fn mac(text: &str) -> Macro {
        let mut all = lines(text);
        let def = all.remove(0);
        let end = all.pop().unwrap();
        assert!(end[0].is_cs(".endmacro"));
        Macro::define(&def, all).unwrap()
    }

    fn render(line: &[Token]) -> String {
        token::format(line)
    }

    #[test]
    fn substitutes_parameters() {
        let m = mac(".macro ldai val\nlda #val\n.endmacro");
        let mut id = 0;
        let out = m.expand(&lines("ldai 3")[0], &mut id).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(render(&out[0]), "lda # $03");
    }

    #[test]
    fn splits_args_on_flat_commas_and_unwraps_groups() {
        let m = mac(".macro two a, b\n.byte a\n.byte b\n.endmacro");
        let mut id = 0;
        let out = m.expand(&lines("two 1 + 2, {3, 4}")[0], &mut id).unwrap();
        assert_eq!(render(&out[0]), ".byte $01 + $02");
        // the group unwrapped into a two-value list
        assert_eq!(render(&out[1]), ".byte $03 , $04");
    }

    #[test]
    fn missing_args_expand_blank_and_extras_are_errors() {
        let m = mac(".macro two a, b\n.byte a b\n.endmacro");
        let mut id = 0;
        let out = m.expand(&lines("two 9")[0], &mut id).unwrap();
        assert_eq!(render(&out[0]), ".byte $09");
        let err = m
            .expand(&lines("two 1, 2, 3")[0], &mut id)
            .unwrap_err()
            .to_string();
        assert!(err.contains("Too many macro parameters"), "{err}");
    }

    #[test]
    fn locals_rename_uniquely_per_expansion() {
        let m = mac(".macro spin\n.local top\ntop:\nbne top\n.endmacro");
        let mut id = 0;
        let call = &lines("spin")[0];
        let first = m.expand(call, &mut id).unwrap();
        let second = m.expand(call, &mut id).unwrap();
        assert_eq!(render(&first[0]), "top@0 :");
        assert_eq!(render(&first[1]), "bne top@0");
        assert_eq!(render(&second[0]), "top@1 :");
        // the .local declaration line itself is dropped
        assert_eq!(first.len(), 2);
    }

    fn def(text: &str) -> Define {
        Define::define(&lines(text)[0]).unwrap()
    }

    // expands line[pos] and renders the result; None when no overload
    // matched
    fn expand_at(d: &Define, text: &str, pos: usize) -> Option<(String, Vec<String>)> {
        let mut line = lines(text).remove(0);
        let overflow = d.expand(&mut line, pos)?;
        Some((
            render(&line),
            overflow.iter().map(|l| render(l)).collect(),
        ))
    }

    #[test]
    fn no_parameter_define_splices_production() {
        let d = def(".define foo x 1 y 2 z");
        let (line, over) = expand_at(&d, "qux foo w", 1).unwrap();
        assert_eq!(line, "qux x $01 y $02 z w");
        assert!(over.is_empty());
    }

    #[test]
    fn c_style_parenthesized_call() {
        let d = def(".define foo (a, b, c) [ a : b : c ]");
        let (line, _) = expand_at(&d, "qux foo(1, 2 22, 3) w", 1).unwrap();
        assert_eq!(line, "qux [ $01 : $02 $16 : $03 ] w");
        // blanks fill in for missing arguments
        let (line, _) = expand_at(&d, "qux foo(1)", 1).unwrap();
        assert_eq!(line, "qux [ $01 : : ]");
        // too many arguments is a failed match
        assert!(expand_at(&d, "qux foo(1, 2, 3, 4)", 1).is_none());
    }

    #[test]
    fn c_style_bare_call_globs_last_parameter() {
        let d = def(".define foo (a, b, c) [ a : b : c ]");
        let (line, _) = expand_at(&d, "qux foo 1 2, 3, 4 5", 1).unwrap();
        assert_eq!(line, "qux [ $01 $02 : $03 : $04 $05 ]");
        // a lone group unwraps; a group with trailing tokens does not
        let (line, _) = expand_at(&d, "qux foo {1, 2}, 3, {4} 5", 1).unwrap();
        assert_eq!(line, "qux [ $01 , $02 : $03 : { $04 } $05 ]");
    }

    #[test]
    fn tex_style_undelimited_takes_one_token_or_group() {
        let d = def(".define foo {a b c} [ a : b : c ]");
        let (line, _) = expand_at(&d, "qux foo {1 2} 3 4", 1).unwrap();
        assert_eq!(line, "qux [ $01 $02 : $03 : $04 ]");
        // an exhausted line fails the match
        assert!(expand_at(&d, "qux foo 1 2", 1).is_none());
    }

    #[test]
    fn tex_style_delimiters_bound_captures() {
        let d = def(".define foo {a, b, c} [ a : b : c ]");
        let (line, _) = expand_at(&d, "qux foo 1 2, 3, 4", 1).unwrap();
        assert_eq!(line, "qux [ $01 $02 : $03 : $04 ]");
        // missing delimiter fails
        assert!(expand_at(&d, "qux foo 1 2 3", 1).is_none());
        // a delimited capture keeps its braces
        let d = def(".define foo {a,} [ a ]");
        let (line, _) = expand_at(&d, "qux foo {1 2}, 3", 1).unwrap();
        assert_eq!(line, "qux [ { $01 $02 } ] $03");
    }

    #[test]
    fn tex_style_eol_delimiter_captures_rest_and_may_be_empty() {
        let d = def(".define foo {a b .eol} [ a : b ]");
        let (line, _) = expand_at(&d, "qux foo 1 2 3", 1).unwrap();
        assert_eq!(line, "qux [ $01 : $02 $03 ]");
        let (line, _) = expand_at(&d, "qux foo 1", 1).unwrap();
        assert_eq!(line, "qux [ $01 : ]");
    }

    #[test]
    fn production_eol_spills_overflow_lines() {
        let d = def(".define foo {x y} [ x ] .eol b y 5");
        let (line, over) = expand_at(&d, "a foo 1 2", 1).unwrap();
        assert_eq!(line, "a [ $01 ]");
        assert_eq!(over, vec!["b $02 $05".to_string()]);
        // a multi-line production cannot splice mid-line
        assert!(expand_at(&d, "a foo 1 2 trailing", 1).is_none());
    }

    #[test]
    fn overloads_try_in_definition_order() {
        let mut d = def(".define foo {x, rest .eol} [ x ] foo rest");
        d.append(def(".define foo {x} [ x ]"));
        let (line, _) = expand_at(&d, "a foo 1, 2", 1).unwrap();
        assert_eq!(line, "a [ $01 ] foo $02");
        // no comma falls through to the second overload
        let (line, _) = expand_at(&d, "a foo 1", 1).unwrap();
        assert_eq!(line, "a [ $01 ]");
    }

    #[test]
    fn body_tokens_carry_the_call_site_as_parent() {
        let m = mac(".macro inc2 addr\ninc addr\ninc addr\n.endmacro");
        let mut id = 0;
        let out = m.expand(&lines("inc2 $20")[0], &mut id).unwrap();
        // 'inc' comes from the definition, with the call line as parent
        let source = out[0][0].source.as_ref().unwrap();
        assert_eq!(source.line, 2);
        assert_eq!(source.parent.as_ref().unwrap().line, 1);
        // the parameter token is spliced in verbatim from the call site
        let arg = out[0][1].source.as_ref().unwrap();
        assert_eq!(arg.line, 1);
        assert!(arg.parent.is_none());
    }
}
