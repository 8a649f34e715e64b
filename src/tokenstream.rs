//! Stacked token sources.
//!
//! The preprocessor reads lines from here.  A frame is pushed for each
//! `.include`d file and for each macro expansion (expansions have no
//! tokenizer, only pushed-back lines); `.exitmacro` pops one early.
//! The stack depth doubles as the recursion guard for both includes
//! and macros.

use crate::expr;
use crate::host::{self, Host};
use crate::token::{self, Token};
use crate::tokenizer::Tokenizer;
use crate::{Error, Result};

const MAX_DEPTH: usize = 100;

struct Frame {
    source: Option<Tokenizer>,
    /// Pushed-back lines, popped from the end.
    buffer: Vec<Vec<Token>>,
}

pub struct TokenStream<'a> {
    host: &'a dyn Host,
    include_paths: Vec<String>,
    stack: Vec<Frame>,
}

impl<'a> TokenStream<'a> {
    pub fn new(host: &'a dyn Host, include_paths: Vec<String>) -> TokenStream<'a> {
        TokenStream {
            host,
            include_paths,
            stack: Vec::new(),
        }
    }

    /// Pushes a frame.  `None` opens an expansion frame that only
    /// serves pushed-back lines.
    pub fn enter(&mut self, source: Option<Tokenizer>) -> Result<()> {
        self.stack.push(Frame {
            source,
            buffer: Vec::new(),
        });
        if self.stack.len() > MAX_DEPTH {
            return Err(Error::Syntax("Stack overflow".to_string()));
        }
        Ok(())
    }

    /// Abandons the current frame and whatever it still had queued.
    pub fn exit(&mut self) {
        self.stack.pop();
    }

    /// Pushes lines back; they are read again before anything else, in
    /// the order given.
    pub fn unshift(&mut self, lines: Vec<Vec<Token>>) -> Result<()> {
        let Some(frame) = self.stack.last_mut() else {
            return Err(Error::Syntax("Cannot unshift after EOF".to_string()));
        };
        for line in lines.into_iter().rev() {
            frame.buffer.push(line);
        }
        Ok(())
    }

    /// Next token line, resolving `.include` and `.incbin` on the way.
    pub fn next(&mut self) -> Result<Option<Vec<Token>>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            if let Some(line) = frame.buffer.pop() {
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            let line = match &mut frame.source {
                Some(source) => source.next_line()?,
                None => None,
            };
            let Some(line) = line else {
                self.stack.pop();
                continue;
            };
            match line.first().and_then(Token::cs_name) {
                Some(".include") => {
                    let path = single_string(&line)?;
                    let text = self.load(&path, |host, full| host.read_string(full))?;
                    self.enter(Some(Tokenizer::new(&text, &path)))?;
                }
                Some(".incbin") => return Ok(Some(self.incbin(&line)?)),
                Some(".macpack") => {
                    return Err(Error::Syntax(format!(
                        ".macpack is not supported{}",
                        line[0].at()
                    )));
                }
                _ => {
                    if !line.is_empty() {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }

    /// Tries each include directory in order; an empty search list
    /// means the path as written.
    fn load<T>(
        &self,
        path: &str,
        read: impl Fn(&dyn Host, &str) -> std::io::Result<T>,
    ) -> Result<T> {
        let bare = [String::new()];
        let dirs: &[String] = if self.include_paths.is_empty() {
            &bare
        } else {
            &self.include_paths
        };
        for dir in dirs {
            if let Ok(data) = read(self.host, &host::join(dir, path)) {
                return Ok(data);
            }
        }
        Err(Error::Syntax(format!(
            "Could not find file {path} in include directories: {}",
            dirs.join(",")
        )))
    }

    /// `.incbin "file"[, offset[, length]]` delivers the (sliced) file
    /// contents as a `.byte` line.
    fn incbin(&mut self, line: &[Token]) -> Result<Vec<Token>> {
        let path = token::expect_string(line.get(1), line.first())?;
        let mut offset = 0usize;
        let mut length: Option<usize> = None;
        if line.len() > 2 {
            let args = token::parse_arg_list(line, 2, line.len())?;
            if let Some(arg) = args.get(1).filter(|a| !a.is_empty()) {
                offset = constant(arg)? as usize;
            }
            if let Some(arg) = args.get(2).filter(|a| !a.is_empty()) {
                length = Some(constant(arg)? as usize);
            }
        }
        let bytes = self.load(&path, |host, full| host.read_bytes(full))?;
        let start = offset.min(bytes.len());
        let end = match length {
            Some(len) => (start + len).min(bytes.len()),
            None => bytes.len(),
        };
        let mut out = vec![Token::cs(".byte").with_source(line[0].source.clone())];
        for (i, b) in bytes[start..end].iter().enumerate() {
            if i > 0 {
                out.push(Token::op(","));
            }
            out.push(Token::num(i64::from(*b)));
        }
        Ok(out)
    }
}

fn single_string(line: &[Token]) -> Result<String> {
    let s = token::expect_string(line.get(1), line.first())?;
    token::expect_eol(line.get(2), "a single string")?;
    Ok(s)
}

fn constant(tokens: &[Token]) -> Result<i64> {
    let expr = expr::evaluate_deep(&expr::parse_only(tokens)?)?;
    expr.abs_value().ok_or_else(|| {
        Error::Eval(format!(
            "Expected a constant: {}",
            token::format(tokens)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemHost;

    fn read_all(stream: &mut TokenStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = stream.next().unwrap() {
            out.push(token::format(&line));
        }
        out
    }

    fn enter_text(stream: &mut TokenStream, text: &str) {
        stream
            .enter(Some(Tokenizer::new(text, "input.s")))
            .unwrap();
    }

    #[test]
    fn include_searches_directories_in_order() {
        let host = MemHost::new();
        host.file("lib/defs.s", "one = 1");
        let mut stream = TokenStream::new(&host, vec!["nope".into(), "lib".into()]);
        enter_text(&mut stream, ".include \"defs.s\"\nlda #one");
        assert_eq!(read_all(&mut stream), vec!["one = $01", "lda # one"]);
    }

    #[test]
    fn missing_include_names_the_searched_directories() {
        let host = MemHost::new();
        let mut stream = TokenStream::new(&host, vec!["a".into(), "b".into()]);
        enter_text(&mut stream, ".include \"gone.s\"");
        let err = stream.next().unwrap_err().to_string();
        assert_eq!(err, "Could not find file gone.s in include directories: a,b");
    }

    #[test]
    fn incbin_slices_and_delivers_bytes() {
        let host = MemHost::new();
        host.bytes("data.bin", &[10, 20, 30, 40, 50]);
        let mut stream = TokenStream::new(&host, vec![]);
        enter_text(&mut stream, ".incbin \"data.bin\", 1, 3");
        let line = stream.next().unwrap().unwrap();
        assert!(line[0].is_cs(".byte"));
        let nums: Vec<i64> = line[1..]
            .iter()
            .filter_map(Token::num_value)
            .collect();
        assert_eq!(nums, vec![20, 30, 40]);
    }

    #[test]
    fn unshift_returns_lines_in_order() {
        let host = MemHost::new();
        let mut stream = TokenStream::new(&host, vec![]);
        enter_text(&mut stream, "tail");
        stream
            .unshift(vec![
                vec![Token::ident("first")],
                vec![Token::ident("second")],
            ])
            .unwrap();
        assert_eq!(read_all(&mut stream), vec!["first", "second", "tail"]);
        let err = stream.unshift(vec![vec![]]).unwrap_err().to_string();
        assert_eq!(err, "Cannot unshift after EOF");
    }

    #[test]
    fn deep_include_recursion_overflows() {
        let host = MemHost::new();
        host.file("loop.s", ".include \"loop.s\"");
        let mut stream = TokenStream::new(&host, vec![]);
        enter_text(&mut stream, ".include \"loop.s\"");
        let mut last = Ok(None);
        for _ in 0..MAX_DEPTH + 1 {
            last = stream.next();
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last.unwrap_err().to_string(), "Stack overflow");
    }

    #[test]
    fn macpack_is_rejected() {
        let host = MemHost::new();
        let mut stream = TokenStream::new(&host, vec![]);
        enter_text(&mut stream, ".macpack generic");
        let err = stream.next().unwrap_err().to_string();
        assert!(err.starts_with(".macpack is not supported"), "{err}");
    }
}
