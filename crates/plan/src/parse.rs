//! The seam to the external SQL grammar.
//!
//! A statement batch is tokenized once, split on top-level semicolons,
//! and each statement is classified:
//!
//! - transaction control (`BEGIN` / `COMMIT` / `ROLLBACK [TO]` /
//!   `SAVEPOINT` / `RELEASE`) is recognized lexically — the grammar is
//!   trivial and keeping it here makes the engine independent of the
//!   upstream parser's coverage of it;
//! - `CREATE TABLE … USING module(args…)` carries a dialect extension the
//!   upstream grammar lacks, so the trailing clause is lifted out of the
//!   token stream before parsing;
//! - everything else goes through `sqlparser` unchanged, except that
//!   `:name` parameters are normalized into placeholder tokens.

use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Word};

use catalog::ModuleClause;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnControl {
    Begin,
    Commit,
    Rollback,
    RollbackTo(String),
    Savepoint(String),
    Release(String),
}

/// The conflict policy of an `INSERT OR …` statement, recognized
/// lexically for grammar stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertConflict {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

#[derive(Debug)]
pub enum ParsedStatement {
    Txn(TxnControl),
    Sql {
        statement: Box<Statement>,
        module: Option<ModuleClause>,
        insert_conflict: Option<InsertConflict>,
    },
}

/// Parse a statement batch.
pub fn parse_batch(sql: &str) -> Result<Vec<ParsedStatement>> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| Error::Parse(e.to_string()))?;

    let mut statements = Vec::new();
    for chunk in split_statements(tokens) {
        if chunk.iter().all(is_ignorable) {
            continue;
        }
        if let Some(txn) = parse_txn_control(&chunk)? {
            statements.push(ParsedStatement::Txn(txn));
            continue;
        }

        let chunk = normalize_named_params(chunk);
        let (chunk, module) = extract_using_clause(chunk);
        let (chunk, insert_conflict) = extract_insert_conflict(chunk);
        let statement = Parser::new(&dialect)
            .with_tokens(chunk)
            .parse_statement()
            .map_err(|e| Error::Parse(e.to_string()))?;
        statements.push(ParsedStatement::Sql {
            statement: Box::new(statement),
            module,
            insert_conflict,
        });
    }
    Ok(statements)
}

fn is_ignorable(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_) | Token::EOF)
}

fn split_statements(tokens: Vec<Token>) -> Vec<Vec<Token>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        match token {
            Token::SemiColon => chunks.push(std::mem::take(&mut current)),
            Token::EOF => {}
            other => current.push(other),
        }
    }
    if !current.iter().all(is_ignorable) {
        chunks.push(current);
    }
    chunks
}

/// The meaningful (non-whitespace) tokens of a chunk.
fn meaningful(chunk: &[Token]) -> Vec<&Token> {
    chunk.iter().filter(|t| !is_ignorable(t)).collect()
}

fn keyword_of(token: &Token) -> Option<Keyword> {
    match token {
        Token::Word(Word { keyword, .. }) => Some(*keyword),
        _ => None,
    }
}

fn word_value(token: &Token) -> Option<String> {
    match token {
        Token::Word(word) => Some(word.value.clone()),
        _ => None,
    }
}

fn parse_txn_control(chunk: &[Token]) -> Result<Option<TxnControl>> {
    let tokens = meaningful(chunk);
    let Some(first) = tokens.first() else {
        return Ok(None);
    };
    let control = match keyword_of(first) {
        Some(Keyword::BEGIN) => TxnControl::Begin,
        Some(Keyword::COMMIT) | Some(Keyword::END) => TxnControl::Commit,
        Some(Keyword::ROLLBACK) => {
            // ROLLBACK [TRANSACTION] [TO [SAVEPOINT] name]
            let mut rest = tokens[1..]
                .iter()
                .filter(|t| keyword_of(t) != Some(Keyword::TRANSACTION));
            match rest.next() {
                None => TxnControl::Rollback,
                Some(to) if keyword_of(to) == Some(Keyword::TO) => {
                    let name = rest
                        .filter(|t| keyword_of(t) != Some(Keyword::SAVEPOINT))
                        .next()
                        .and_then(|t| word_value(t))
                        .ok_or_else(|| {
                            Error::Parse("ROLLBACK TO requires a savepoint name".to_string())
                        })?;
                    TxnControl::RollbackTo(name)
                }
                Some(other) => {
                    return Err(Error::Parse(format!(
                        "unexpected token after ROLLBACK: {other}"
                    )))
                }
            }
        }
        Some(Keyword::SAVEPOINT) => {
            let name = tokens
                .get(1)
                .and_then(|t| word_value(t))
                .ok_or_else(|| Error::Parse("SAVEPOINT requires a name".to_string()))?;
            TxnControl::Savepoint(name)
        }
        Some(Keyword::RELEASE) => {
            let name = tokens[1..]
                .iter()
                .filter(|t| keyword_of(t) != Some(Keyword::SAVEPOINT))
                .next()
                .and_then(|t| word_value(t))
                .ok_or_else(|| Error::Parse("RELEASE requires a savepoint name".to_string()))?;
            TxnControl::Release(name)
        }
        _ => return Ok(None),
    };
    Ok(Some(control))
}

/// Replace `:name` token pairs with placeholder tokens, so named
/// parameters survive the trip through the upstream grammar.
fn normalize_named_params(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut pending_colon = false;
    for token in tokens {
        match (&token, pending_colon) {
            (Token::Colon, false) => {
                pending_colon = true;
            }
            (Token::Word(word), true) => {
                out.push(Token::Placeholder(format!(":{}", word.value)));
                pending_colon = false;
            }
            (_, true) => {
                out.push(Token::Colon);
                pending_colon = false;
                out.push(token);
            }
            _ => out.push(token),
        }
    }
    if pending_colon {
        out.push(Token::Colon);
    }
    out
}

/// Lift the `OR policy` clause off an `INSERT OR …` statement; the
/// upstream grammar only knows it under one dialect.
fn extract_insert_conflict(tokens: Vec<Token>) -> (Vec<Token>, Option<InsertConflict>) {
    let heads: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| !is_ignorable(token))
        .map(|(at, _)| at)
        .take(3)
        .collect();
    let [insert_at, or_at, policy_at] = heads.as_slice() else {
        return (tokens, None);
    };
    if keyword_of(&tokens[*insert_at]) != Some(Keyword::INSERT)
        || keyword_of(&tokens[*or_at]) != Some(Keyword::OR)
    {
        return (tokens, None);
    }
    let policy = match keyword_of(&tokens[*policy_at]) {
        Some(Keyword::ROLLBACK) => InsertConflict::Rollback,
        Some(Keyword::ABORT) => InsertConflict::Abort,
        Some(Keyword::FAIL) => InsertConflict::Fail,
        Some(Keyword::IGNORE) => InsertConflict::Ignore,
        Some(Keyword::REPLACE) => InsertConflict::Replace,
        _ => return (tokens, None),
    };
    let (or_at, policy_at) = (*or_at, *policy_at);
    let kept = tokens
        .into_iter()
        .enumerate()
        .filter(|(at, _)| *at != or_at && *at != policy_at)
        .map(|(_, token)| token)
        .collect();
    (kept, Some(policy))
}

/// Lift a trailing `USING module(args…)` off a CREATE TABLE statement.
fn extract_using_clause(tokens: Vec<Token>) -> (Vec<Token>, Option<ModuleClause>) {
    {
        let heads = meaningful(&tokens);
        let is_create_table = keyword_of(heads.first().copied().unwrap_or(&Token::EOF))
            == Some(Keyword::CREATE)
            && heads.iter().take(4).any(|t| keyword_of(t) == Some(Keyword::TABLE));
        if !is_create_table {
            return (tokens, None);
        }
    }

    // Find a depth-0 USING keyword after the column list.
    let mut depth = 0i32;
    let mut using_at = None;
    for (at, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            _ => {
                if depth == 0 && keyword_of(token) == Some(Keyword::USING) {
                    using_at = Some(at);
                    break;
                }
            }
        }
    }
    let Some(using_at) = using_at else {
        return (tokens, None);
    };

    let mut module_name = None;
    let mut args = Vec::new();
    let consumed_until;
    let mut cursor = using_at + 1;

    // Module name.
    while cursor < tokens.len() {
        let token = &tokens[cursor];
        cursor += 1;
        if is_ignorable(token) {
            continue;
        }
        module_name = word_value(token);
        break;
    }

    // Optional parenthesized argument list.
    let mut peek = cursor;
    while peek < tokens.len() && is_ignorable(&tokens[peek]) {
        peek += 1;
    }
    if peek < tokens.len() && tokens[peek] == Token::LParen {
        let mut depth = 1;
        let mut current = String::new();
        cursor = peek + 1;
        while cursor < tokens.len() && depth > 0 {
            let token = &tokens[cursor];
            cursor += 1;
            match token {
                Token::LParen => {
                    depth += 1;
                    current.push('(');
                }
                Token::RParen => {
                    depth -= 1;
                    if depth > 0 {
                        current.push(')');
                    }
                }
                Token::Comma if depth == 1 => {
                    args.push(std::mem::take(&mut current).trim().to_string());
                }
                Token::Whitespace(_) => current.push(' '),
                other => current.push_str(&other.to_string()),
            }
        }
        let last = current.trim();
        if !last.is_empty() {
            args.push(last.to_string());
        }
        consumed_until = cursor;
    } else {
        consumed_until = cursor;
    }

    let Some(name) = module_name else {
        return (tokens, None);
    };

    let mut kept: Vec<Token> = tokens[..using_at].to_vec();
    kept.extend(tokens[consumed_until..].iter().cloned());
    (
        kept,
        Some(ModuleClause {
            name,
            args,
        }),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_txn_control_statements() {
        let parsed = parse_batch(
            "BEGIN; SAVEPOINT s1; RELEASE SAVEPOINT s1; \
             ROLLBACK TO SAVEPOINT s2; ROLLBACK; COMMIT;",
        )
        .unwrap();

        let controls: Vec<_> = parsed
            .iter()
            .map(|s| match s {
                ParsedStatement::Txn(txn) => txn.clone(),
                other => panic!("expected txn control, got {other:?}"),
            })
            .collect();
        assert_eq!(
            controls,
            vec![
                TxnControl::Begin,
                TxnControl::Savepoint("s1".to_string()),
                TxnControl::Release("s1".to_string()),
                TxnControl::RollbackTo("s2".to_string()),
                TxnControl::Rollback,
                TxnControl::Commit,
            ]
        );
    }

    #[test]
    fn test_using_clause_extraction() {
        let parsed =
            parse_batch("CREATE TABLE t (a INT PRIMARY KEY, b TEXT) USING memory(cache = 16)")
                .unwrap();
        let ParsedStatement::Sql { statement, module, .. } = &parsed[0] else {
            panic!("expected a SQL statement");
        };
        assert_eq!(
            module.as_ref().unwrap(),
            &ModuleClause {
                name: "memory".to_string(),
                args: vec!["cache = 16".to_string()],
            }
        );
        assert!(matches!(**statement, Statement::CreateTable { .. }));
    }

    #[test]
    fn test_using_without_args_and_without_using() {
        let parsed = parse_batch("CREATE TABLE t (a INT) USING memory").unwrap();
        let ParsedStatement::Sql { module, .. } = &parsed[0] else {
            panic!("expected a SQL statement");
        };
        assert_eq!(module.as_ref().unwrap().name, "memory");
        assert!(module.as_ref().unwrap().args.is_empty());

        let parsed = parse_batch("CREATE TABLE t (a INT)").unwrap();
        let ParsedStatement::Sql { module, .. } = &parsed[0] else {
            panic!("expected a SQL statement");
        };
        assert!(module.is_none());
    }

    #[test]
    fn test_named_param_normalization() {
        let parsed = parse_batch("SELECT :wanted").unwrap();
        let ParsedStatement::Sql { statement, .. } = &parsed[0] else {
            panic!("expected a SQL statement");
        };
        let rendered = statement.to_string();
        assert!(rendered.contains(":wanted"), "got {rendered}");
    }

    #[test]
    fn test_batch_splits_and_skips_blanks() {
        let parsed = parse_batch("SELECT 1; ; SELECT 2;").unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_error_surfaces() {
        assert!(matches!(
            parse_batch("SELEKT 1").unwrap_err(),
            Error::Parse(_)
        ));
    }
}
