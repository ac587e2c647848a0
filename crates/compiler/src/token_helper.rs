//! Small token inspection helpers shared by the processing steps.

use lemon_core::{
    Keyword, Operator, ParenthesisType, StatementNode, StatementToken, Token,
};

pub fn is_operator(token: &Token, op: Operator) -> bool {
    matches!(token, Token::Operator(found) if *found == op)
}

pub fn is_keyword(token: &Token, keyword: Keyword) -> bool {
    matches!(token, Token::Keyword(found) if *found == keyword)
}

pub fn is_parenthesis(token: &Token, parenthesis_type: ParenthesisType) -> bool {
    matches!(
        token,
        Token::Statement(StatementToken {
            node: StatementNode::Parenthesis {
                parenthesis_type: found,
                ..
            },
            ..
        }) if *found == parenthesis_type
    )
}

/// The parenthesis content, when the token is a parenthesis of that kind.
pub fn parenthesis_content(
    token: &Token,
    parenthesis_type: ParenthesisType,
) -> Option<&lemon_core::TokenList> {
    match token {
        Token::Statement(StatementToken {
            node:
                StatementNode::Parenthesis {
                    parenthesis_type: found,
                    content,
                },
            ..
        }) if *found == parenthesis_type => Some(content),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemon_core::TokenList;

    #[test]
    fn test_helpers() {
        let op = Token::Operator(Operator::CommaSeparator);
        assert!(is_operator(&op, Operator::CommaSeparator));
        assert!(!is_operator(&op, Operator::BinaryPlus));

        let keyword = Token::Keyword(Keyword::Addressof);
        assert!(is_keyword(&keyword, Keyword::Addressof));

        let parenthesis = Token::Statement(StatementToken::new(StatementNode::Parenthesis {
            parenthesis_type: ParenthesisType::Bracket,
            content: TokenList::new(),
        }));
        assert!(is_parenthesis(&parenthesis, ParenthesisType::Bracket));
        assert!(!is_parenthesis(&parenthesis, ParenthesisType::Parenthesis));
        assert!(parenthesis_content(&parenthesis, ParenthesisType::Bracket).is_some());
    }
}
