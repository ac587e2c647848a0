//! Token model
//!
//! The parser hands the token processor a flat [`TokenList`] per line or
//! expression. Processing reshapes it in place into a tree: statement
//! tokens own their children, and every statement eventually carries a data
//! type. The token set is a tagged sum matched exhaustively — there is no
//! open hierarchy.

use std::fmt;
use std::sync::Arc;

use crate::any_value::AnyBaseValue;
use crate::binary::{BinaryReader, BinaryWriter, ReadError};
use crate::data_type::DataTypeRef;
use crate::flyweight::FlyweightString;
use crate::globals::{FunctionRef, GlobalsLookup, Identifier, VariableInfo};
use crate::operator::Operator;

/// Script keywords that can appear inside expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Function,
    Global,
    Constant,
    Define,
    If,
    Else,
    While,
    For,
    Return,
    Break,
    Continue,
    Addressof,
    MakeCallable,
}

/// Round vs. square brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParenthesisType {
    Parenthesis,
    Bracket,
}

/// One parser token. Statement tokens may appear inside expressions and are
/// the only ones that carry a data type.
#[derive(Debug, Clone)]
pub enum Token {
    Keyword(Keyword),
    VarType(DataTypeRef),
    Operator(Operator),
    Label(FlyweightString),
    Statement(StatementToken),
}

impl Token {
    pub fn is_statement(&self) -> bool {
        matches!(self, Token::Statement(_))
    }

    pub fn as_statement(&self) -> Option<&StatementToken> {
        match self {
            Token::Statement(st) => Some(st),
            _ => None,
        }
    }

    pub fn as_statement_mut(&mut self) -> Option<&mut StatementToken> {
        match self {
            Token::Statement(st) => Some(st),
            _ => None,
        }
    }

    pub fn into_statement(self) -> Option<StatementToken> {
        match self {
            Token::Statement(st) => Some(st),
            _ => None,
        }
    }
}

/// A statement token: a node of the typed expression tree.
#[derive(Debug, Clone)]
pub struct StatementToken {
    /// Null until type assignment has run over the tree.
    pub data_type: Option<DataTypeRef>,
    pub node: StatementNode,
}

impl StatementToken {
    pub fn new(node: StatementNode) -> Self {
        StatementToken {
            data_type: None,
            node,
        }
    }

    pub fn typed(node: StatementNode, data_type: DataTypeRef) -> Self {
        StatementToken {
            data_type: Some(data_type),
            node,
        }
    }
}

/// The eleven statement forms.
#[derive(Debug, Clone)]
pub enum StatementNode {
    Constant {
        value: AnyBaseValue,
    },
    /// An unresolved name; `resolved` is filled by identifier resolution.
    Identifier {
        name: FlyweightString,
        resolved: Option<Identifier>,
    },
    Parenthesis {
        parenthesis_type: ParenthesisType,
        content: TokenList,
    },
    CommaSeparatedList {
        content: Vec<TokenList>,
    },
    UnaryOperation {
        op: Operator,
        argument: Box<StatementToken>,
    },
    BinaryOperation {
        op: Operator,
        left: Box<StatementToken>,
        right: Box<StatementToken>,
        /// Set when a specific built-in function implements the operator
        /// (string concatenation and friends).
        function: Option<FunctionRef>,
    },
    Variable {
        variable: VariableInfo,
    },
    FunctionCall {
        function: Option<FunctionRef>,
        is_base_call: bool,
        parameters: Vec<StatementToken>,
    },
    BracketAccess {
        variable: VariableInfo,
        index: Box<StatementToken>,
    },
    MemoryAccess {
        address: Box<StatementToken>,
    },
    ValueCast {
        argument: Box<StatementToken>,
    },
}

/// A flat, mutable list of tokens with the splice helpers the processor
/// uses to reshape it in place.
#[derive(Debug, Clone, Default)]
pub struct TokenList {
    tokens: Vec<Token>,
}

impl TokenList {
    pub fn new() -> Self {
        TokenList { tokens: Vec::new() }
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        TokenList { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Token> {
        self.tokens.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Token> {
        self.tokens.get_mut(index)
    }

    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }

    pub fn insert(&mut self, index: usize, token: Token) {
        self.tokens.insert(index, token);
    }

    pub fn remove(&mut self, index: usize) -> Token {
        self.tokens.remove(index)
    }

    pub fn replace(&mut self, index: usize, token: Token) -> Token {
        std::mem::replace(&mut self.tokens[index], token)
    }

    /// Move `count` tokens starting at `start` out of this list, returning
    /// them as a new list (the parenthesis/comma packing primitive).
    pub fn extract_range(&mut self, start: usize, count: usize) -> TokenList {
        TokenList {
            tokens: self.tokens.drain(start..start + count).collect(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.tokens.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Token> {
        self.tokens.iter_mut()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

impl std::ops::Index<usize> for TokenList {
    type Output = Token;
    fn index(&self, index: usize) -> &Token {
        &self.tokens[index]
    }
}

impl std::ops::IndexMut<usize> for TokenList {
    fn index_mut(&mut self, index: usize) -> &mut Token {
        &mut self.tokens[index]
    }
}

/// Error raised when serializing a token kind the module format does not
/// store (resolved variables, function calls, …).
#[derive(Debug, Clone)]
pub struct TokenSerializeError(pub String);

impl fmt::Display for TokenSerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token serialization: {}", self.0)
    }
}

impl std::error::Error for TokenSerializeError {}

// Tags of the serialized token forms. Only pre-resolution shapes are
// supported; defines are serialized before any processing has run on them.
const TAG_KEYWORD: u8 = 0;
const TAG_VAR_TYPE: u8 = 1;
const TAG_OPERATOR: u8 = 2;
const TAG_LABEL: u8 = 3;
const TAG_CONSTANT: u8 = 4;
const TAG_IDENTIFIER: u8 = 5;
const TAG_PARENTHESIS: u8 = 6;
const TAG_COMMA_LIST: u8 = 7;

/// Serialization of token lists as stored inside defines in the module
/// binary format.
pub struct TokenSerializer;

impl TokenSerializer {
    pub fn write_token_list(
        writer: &mut BinaryWriter,
        list: &TokenList,
    ) -> Result<(), TokenSerializeError> {
        writer.write_u16(list.len() as u16);
        for token in list.iter() {
            Self::write_token(writer, token)?;
        }
        Ok(())
    }

    fn write_token(writer: &mut BinaryWriter, token: &Token) -> Result<(), TokenSerializeError> {
        match token {
            Token::Keyword(keyword) => {
                writer.write_u8(TAG_KEYWORD);
                writer.write_u8(*keyword as u8);
            }
            Token::VarType(data_type) => {
                writer.write_u8(TAG_VAR_TYPE);
                writer.write_u16(data_type.id());
            }
            Token::Operator(op) => {
                writer.write_u8(TAG_OPERATOR);
                writer.write_u8(*op as u8);
            }
            Token::Label(name) => {
                writer.write_u8(TAG_LABEL);
                writer.write_flyweight(name);
            }
            Token::Statement(statement) => match &statement.node {
                StatementNode::Constant { value } => {
                    writer.write_u8(TAG_CONSTANT);
                    let type_id = statement
                        .data_type
                        .as_ref()
                        .map(|ty| ty.id())
                        .unwrap_or(0xffff);
                    writer.write_u16(type_id);
                    writer.write_u64(value.raw());
                }
                StatementNode::Identifier { name, .. } => {
                    writer.write_u8(TAG_IDENTIFIER);
                    writer.write_flyweight(name);
                }
                StatementNode::Parenthesis {
                    parenthesis_type,
                    content,
                } => {
                    writer.write_u8(TAG_PARENTHESIS);
                    writer.write_u8(matches!(parenthesis_type, ParenthesisType::Bracket) as u8);
                    Self::write_token_list(writer, content)?;
                }
                StatementNode::CommaSeparatedList { content } => {
                    writer.write_u8(TAG_COMMA_LIST);
                    writer.write_u16(content.len() as u16);
                    for list in content {
                        Self::write_token_list(writer, list)?;
                    }
                }
                other => {
                    return Err(TokenSerializeError(format!(
                        "statement token kind is not supported in serialization: {:?}",
                        std::mem::discriminant(other)
                    )));
                }
            },
        }
        Ok(())
    }

    pub fn read_token_list(
        reader: &mut BinaryReader<'_>,
        lookup: &GlobalsLookup,
    ) -> Result<TokenList, ReadError> {
        let count = reader.read_u16()? as usize;
        let mut list = TokenList::new();
        for _ in 0..count {
            list.push(Self::read_token(reader, lookup)?);
        }
        Ok(list)
    }

    fn read_token(
        reader: &mut BinaryReader<'_>,
        lookup: &GlobalsLookup,
    ) -> Result<Token, ReadError> {
        let tag = reader.read_u8()?;
        let token = match tag {
            TAG_KEYWORD => {
                let raw = reader.read_u8()?;
                let keyword = keyword_from_u8(raw)
                    .ok_or_else(|| ReadError::InvalidData(format!("unknown keyword {}", raw)))?;
                Token::Keyword(keyword)
            }
            TAG_VAR_TYPE => {
                let id = reader.read_u16()?;
                let data_type = lookup
                    .data_type_by_id(id)
                    .ok_or_else(|| ReadError::InvalidData(format!("unknown data type ID {}", id)))?;
                Token::VarType(data_type)
            }
            TAG_OPERATOR => {
                let raw = reader.read_u8()?;
                let op = operator_from_u8(raw)
                    .ok_or_else(|| ReadError::InvalidData(format!("unknown operator {}", raw)))?;
                Token::Operator(op)
            }
            TAG_LABEL => Token::Label(reader.read_flyweight()?),
            TAG_CONSTANT => {
                let type_id = reader.read_u16()?;
                let data_type = if type_id == 0xffff {
                    None
                } else {
                    Some(lookup.data_type_by_id(type_id).ok_or_else(|| {
                        ReadError::InvalidData(format!("unknown data type ID {}", type_id))
                    })?)
                };
                let value = AnyBaseValue::from_raw(reader.read_u64()?);
                Token::Statement(StatementToken {
                    data_type,
                    node: StatementNode::Constant { value },
                })
            }
            TAG_IDENTIFIER => Token::Statement(StatementToken::new(StatementNode::Identifier {
                name: reader.read_flyweight()?,
                resolved: None,
            })),
            TAG_PARENTHESIS => {
                let parenthesis_type = if reader.read_u8()? != 0 {
                    ParenthesisType::Bracket
                } else {
                    ParenthesisType::Parenthesis
                };
                let content = Self::read_token_list(reader, lookup)?;
                Token::Statement(StatementToken::new(StatementNode::Parenthesis {
                    parenthesis_type,
                    content,
                }))
            }
            TAG_COMMA_LIST => {
                let count = reader.read_u16()? as usize;
                let mut content = Vec::with_capacity(count);
                for _ in 0..count {
                    content.push(Self::read_token_list(reader, lookup)?);
                }
                Token::Statement(StatementToken::new(StatementNode::CommaSeparatedList {
                    content,
                }))
            }
            other => {
                return Err(ReadError::InvalidData(format!("unknown token tag {}", other)));
            }
        };
        Ok(token)
    }
}

fn keyword_from_u8(value: u8) -> Option<Keyword> {
    use Keyword as K;
    Some(match value {
        0 => K::Function,
        1 => K::Global,
        2 => K::Constant,
        3 => K::Define,
        4 => K::If,
        5 => K::Else,
        6 => K::While,
        7 => K::For,
        8 => K::Return,
        9 => K::Break,
        10 => K::Continue,
        11 => K::Addressof,
        12 => K::MakeCallable,
        _ => return None,
    })
}

fn operator_from_u8(value: u8) -> Option<Operator> {
    if (value as usize) < crate::operator::NUM_OPERATORS {
        Some(unsafe { std::mem::transmute::<u8, Operator>(value) })
    } else {
        None
    }
}

/// Shared, immutable define content handed out by the globals lookup;
/// expansion deep-copies the inner list.
pub type SharedTokenList = Arc<TokenList>;
