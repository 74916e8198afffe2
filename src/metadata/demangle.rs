//! Demangling of RTTI type names.
//!
//! Type descriptors carry decorated names such as `.?AVexception@std@@`. The readable
//! form (`class std::exception`) is what `type_info::name()` reports; it is computed on
//! first use and cached in the descriptor. Only the subset of the decoration grammar
//! used for RTTI names of common types is understood: classes, structs, unions and enums
//! with namespace qualification, fundamental types, and pointers to any of those.
//! Anything else yields `None` and callers fall back to the decorated name.

/// Demangles a decorated RTTI type name.
///
/// # Examples
///
/// ```rust
/// use cxxframe::metadata::demangle_type_name;
///
/// assert_eq!(demangle_type_name(".?AVexception@std@@").as_deref(), Some("class std::exception"));
/// assert_eq!(demangle_type_name(".H").as_deref(), Some("int"));
/// assert_eq!(demangle_type_name(".PBD").as_deref(), Some("char const *"));
/// assert_eq!(demangle_type_name(".?AV?$vector@H@std@@"), None);
/// ```
#[must_use]
pub fn demangle_type_name(mangled: &str) -> Option<String> {
    let body = mangled.strip_prefix('.')?;
    let body = body.strip_prefix("?A").unwrap_or(body);

    let mut parser = Parser {
        input: body.as_bytes(),
        position: 0,
    };
    let name = parser.parse_type()?;
    (parser.position == parser.input.len()).then_some(name)
}

struct Parser<'a> {
    input: &'a [u8],
    position: usize,
}

impl Parser<'_> {
    fn next(&mut self) -> Option<u8> {
        let byte = *self.input.get(self.position)?;
        self.position += 1;
        Some(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn parse_type(&mut self) -> Option<String> {
        let name = match self.next()? {
            b'C' => "signed char",
            b'D' => "char",
            b'E' => "unsigned char",
            b'F' => "short",
            b'G' => "unsigned short",
            b'H' => "int",
            b'I' => "unsigned int",
            b'J' => "long",
            b'K' => "unsigned long",
            b'M' => "float",
            b'N' => "double",
            b'O' => "long double",
            b'X' => "void",
            b'_' => match self.next()? {
                b'J' => "__int64",
                b'K' => "unsigned __int64",
                b'N' => "bool",
                b'W' => "wchar_t",
                _ => return None,
            },
            b'V' => return self.qualified_name().map(|n| format!("class {n}")),
            b'U' => return self.qualified_name().map(|n| format!("struct {n}")),
            b'T' => return self.qualified_name().map(|n| format!("union {n}")),
            b'W' => {
                if self.next()? != b'4' {
                    return None;
                }
                return self.qualified_name().map(|n| format!("enum {n}"));
            }
            b'P' => return self.pointer(),
            _ => return None,
        };
        Some(name.to_string())
    }

    fn pointer(&mut self) -> Option<String> {
        // 64-bit pointer marker
        if self.peek() == Some(b'E') {
            self.position += 1;
        }

        let qualifier = match self.next()? {
            b'A' => "",
            b'B' => " const",
            b'C' => " volatile",
            b'D' => " const volatile",
            _ => return None,
        };
        let pointee = self.parse_type()?;
        Some(format!("{pointee}{qualifier} *"))
    }

    fn qualified_name(&mut self) -> Option<String> {
        let mut segments = Vec::new();
        loop {
            let start = self.position;
            while self.peek()? != b'@' {
                self.position += 1;
            }
            let segment = &self.input[start..self.position];
            self.position += 1;

            if segment.is_empty() {
                break;
            }
            // Templates, back-references and special names are not supported
            if segment[0] == b'?' || segment[0].is_ascii_digit() {
                return None;
            }
            segments.push(std::str::from_utf8(segment).ok()?);
        }

        if segments.is_empty() {
            return None;
        }
        segments.reverse();
        Some(segments.join("::"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records() {
        assert_eq!(demangle_type_name(".?AVfoo@@").as_deref(), Some("class foo"));
        assert_eq!(
            demangle_type_name(".?AUpoint@geo@app@@").as_deref(),
            Some("struct app::geo::point")
        );
        assert_eq!(demangle_type_name(".?ATvalue@@").as_deref(), Some("union value"));
        assert_eq!(demangle_type_name(".?AW4Color@@").as_deref(), Some("enum Color"));
    }

    #[test]
    fn test_fundamentals() {
        assert_eq!(demangle_type_name(".N").as_deref(), Some("double"));
        assert_eq!(demangle_type_name("._N").as_deref(), Some("bool"));
        assert_eq!(demangle_type_name("._K").as_deref(), Some("unsigned __int64"));
    }

    #[test]
    fn test_pointers() {
        assert_eq!(demangle_type_name(".PAH").as_deref(), Some("int *"));
        assert_eq!(demangle_type_name(".PEBD").as_deref(), Some("char const *"));
        assert_eq!(
            demangle_type_name(".PAVfoo@@").as_deref(),
            Some("class foo *")
        );
        assert_eq!(demangle_type_name(".PAPAX").as_deref(), Some("void * *"));
    }

    #[test]
    fn test_rejects() {
        assert_eq!(demangle_type_name("?AVfoo@@"), None);
        assert_eq!(demangle_type_name(".?AVfoo@"), None);
        assert_eq!(demangle_type_name(".?AV?$box@H@@"), None);
        assert_eq!(demangle_type_name(".HH"), None);
        assert_eq!(demangle_type_name(".?AV@"), None);
    }
}
