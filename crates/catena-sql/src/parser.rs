//! Recursive-descent parser for the Catena SQL dialect.
//!
//! The combined nesting depth of subexpressions and sub-statements is
//! bounded by [`crate::MAX_DEPTH`]; deeper input is rejected at parse
//! time rather than risking unbounded recursion on hostile statements.

use catena_crypto::Hash;

use crate::ast::{
    BinaryOperator, ColumnDefinition, CreateTable, DataType, Delete, Expression, Insert, Join,
    Literal, OrderDirection, PrivilegeSpec, Select, Show, Statement, UnaryOperator, Update,
};
use crate::privilege::PrivilegeKind;
use crate::token::{Keyword, Lexer, Token};
use crate::{Result, SqlError, MAX_DEPTH};

/// Parse a single semicolon-terminated statement.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let tokens = Lexer::new(sql).tokenize()?;
    let mut parser = Parser::new(tokens);
    let statement = parser.statement()?;
    parser.expect(&Token::Semicolon)?;
    if !parser.at_end() {
        return Err(SqlError::Parse("trailing input after statement".into()));
    }
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| SqlError::Parse("unexpected end of statement".into()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(SqlError::Parse(format!("expected {expected}, got {token}")))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<()> {
        self.expect(&Token::Keyword(keyword))
    }

    fn accept(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn accept_keyword(&mut self, keyword: Keyword) -> bool {
        self.accept(&Token::Keyword(keyword))
    }

    fn identifier(&mut self) -> Result<String> {
        match self.next()? {
            Token::Identifier(name) => Ok(name),
            token => Err(SqlError::Parse(format!("expected identifier, got {token}"))),
        }
    }

    fn hash_blob(&mut self) -> Result<Hash> {
        match self.next()? {
            Token::Blob(bytes) => {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| SqlError::Parse("expected a 32-byte hash blob".into()))?;
                Ok(Hash::from_bytes(arr))
            }
            token => Err(SqlError::Parse(format!(
                "expected blob literal, got {token}"
            ))),
        }
    }

    /// Run a nested parse one level deeper, enforcing the depth bound.
    fn descend<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(SqlError::NestingTooDeep);
        }
        let result = f(self);
        self.depth -= 1;
        result
    }

    // ----- statements -----

    fn statement(&mut self) -> Result<Statement> {
        match self.next()? {
            Token::Keyword(Keyword::Select) => self.select().map(Statement::Select),
            Token::Keyword(Keyword::Insert) => self.insert(),
            Token::Keyword(Keyword::Update) => self.update(),
            Token::Keyword(Keyword::Delete) => self.delete(),
            Token::Keyword(Keyword::Create) => self.create(),
            Token::Keyword(Keyword::Drop) => self.drop_object(),
            Token::Keyword(Keyword::Show) => self.show(),
            Token::Keyword(Keyword::Describe) => {
                let table = self.identifier()?;
                Ok(Statement::Describe { table })
            }
            Token::Keyword(Keyword::Grant) => {
                let (privilege, user) = self.grant_clause()?;
                Ok(Statement::Grant { privilege, user })
            }
            Token::Keyword(Keyword::Revoke) => {
                let (privilege, user) = self.grant_clause()?;
                Ok(Statement::Revoke { privilege, user })
            }
            Token::Keyword(Keyword::If) => self.if_statement(),
            Token::Keyword(Keyword::Do) => self.block(),
            Token::Keyword(Keyword::Fail) => Ok(Statement::Fail),
            token => Err(SqlError::Parse(format!(
                "expected start of statement, got {token}"
            ))),
        }
    }

    fn select(&mut self) -> Result<Select> {
        let distinct = self.accept_keyword(Keyword::Distinct);

        let mut columns = Vec::new();
        loop {
            if self.accept(&Token::Asterisk) {
                columns.push(Expression::AllColumns);
            } else {
                columns.push(self.expression()?);
            }
            if !self.accept(&Token::Comma) {
                break;
            }
        }

        let mut from = None;
        let mut joins = Vec::new();
        if self.accept_keyword(Keyword::From) {
            from = Some(self.identifier()?);
            while self.accept_keyword(Keyword::Left) {
                self.expect_keyword(Keyword::Join)?;
                let table = self.identifier()?;
                self.expect_keyword(Keyword::On)?;
                let on = self.expression()?;
                joins.push(Join { table, on });
            }
        }

        let where_clause = if self.accept_keyword(Keyword::Where) {
            Some(self.expression()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.accept_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                let expression = self.expression()?;
                let direction = if self.accept_keyword(Keyword::Desc) {
                    OrderDirection::Descending
                } else {
                    self.accept_keyword(Keyword::Asc);
                    OrderDirection::Ascending
                };
                order_by.push((expression, direction));
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }

        let limit = if self.accept_keyword(Keyword::Limit) {
            match self.next()? {
                Token::Integer(n) if n >= 0 => Some(n as u64),
                token => {
                    return Err(SqlError::Parse(format!(
                        "expected non-negative LIMIT, got {token}"
                    )))
                }
            }
        } else {
            None
        };

        Ok(Select {
            distinct,
            columns,
            from,
            joins,
            where_clause,
            order_by,
            limit,
        })
    }

    fn insert(&mut self) -> Result<Statement> {
        let or_replace = if self.accept_keyword(Keyword::Or) {
            self.expect_keyword(Keyword::Replace)?;
            true
        } else {
            false
        };
        self.expect_keyword(Keyword::Into)?;
        let table = self.identifier()?;

        self.expect(&Token::OpenParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.identifier()?);
            if !self.accept(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::CloseParen)?;

        self.expect_keyword(Keyword::Values)?;
        let mut values = Vec::new();
        loop {
            self.expect(&Token::OpenParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.expression()?);
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::CloseParen)?;
            values.push(row);
            if !self.accept(&Token::Comma) {
                break;
            }
        }

        Ok(Statement::Insert(Insert {
            or_replace,
            table,
            columns,
            values,
        }))
    }

    fn update(&mut self) -> Result<Statement> {
        let table = self.identifier()?;
        self.expect_keyword(Keyword::Set)?;
        let mut assignments = Vec::new();
        loop {
            let column = self.identifier()?;
            self.expect(&Token::Equal)?;
            let value = self.expression()?;
            assignments.push((column, value));
            if !self.accept(&Token::Comma) {
                break;
            }
        }
        let where_clause = if self.accept_keyword(Keyword::Where) {
            Some(self.expression()?)
        } else {
            None
        };
        Ok(Statement::Update(Update {
            table,
            assignments,
            where_clause,
        }))
    }

    fn delete(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::From)?;
        let table = self.identifier()?;
        let where_clause = if self.accept_keyword(Keyword::Where) {
            Some(self.expression()?)
        } else {
            None
        };
        Ok(Statement::Delete(Delete {
            table,
            where_clause,
        }))
    }

    fn create(&mut self) -> Result<Statement> {
        match self.next()? {
            Token::Keyword(Keyword::Table) => {
                let table = self.identifier()?;
                self.expect(&Token::OpenParen)?;
                let mut columns = Vec::new();
                loop {
                    let name = self.identifier()?;
                    let data_type = self.data_type()?;
                    let primary_key = if self.accept_keyword(Keyword::Primary) {
                        self.expect_keyword(Keyword::Key)?;
                        true
                    } else {
                        false
                    };
                    columns.push(ColumnDefinition {
                        name,
                        data_type,
                        primary_key,
                    });
                    if !self.accept(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::CloseParen)?;
                Ok(Statement::CreateTable(CreateTable { table, columns }))
            }
            Token::Keyword(Keyword::Index) => {
                let name = self.identifier()?;
                self.expect_keyword(Keyword::On)?;
                let table = self.identifier()?;
                self.expect(&Token::OpenParen)?;
                let mut columns = Vec::new();
                loop {
                    columns.push(self.identifier()?);
                    if !self.accept(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::CloseParen)?;
                Ok(Statement::CreateIndex {
                    name,
                    table,
                    columns,
                })
            }
            Token::Keyword(Keyword::Database) => {
                let database = self.identifier()?;
                Ok(Statement::CreateDatabase { database })
            }
            token => Err(SqlError::Parse(format!(
                "expected TABLE, INDEX or DATABASE, got {token}"
            ))),
        }
    }

    fn drop_object(&mut self) -> Result<Statement> {
        match self.next()? {
            Token::Keyword(Keyword::Table) => {
                let table = self.identifier()?;
                Ok(Statement::DropTable { table })
            }
            Token::Keyword(Keyword::Database) => {
                let database = self.identifier()?;
                Ok(Statement::DropDatabase { database })
            }
            token => Err(SqlError::Parse(format!(
                "expected TABLE or DATABASE, got {token}"
            ))),
        }
    }

    fn show(&mut self) -> Result<Statement> {
        match self.next()? {
            Token::Keyword(Keyword::Tables) => Ok(Statement::Show(Show::Tables)),
            Token::Keyword(Keyword::Grants) => Ok(Statement::Show(Show::Grants)),
            Token::Keyword(Keyword::All) => Ok(Statement::Show(Show::All)),
            Token::Keyword(Keyword::Databases) => {
                let for_user = if self.accept_keyword(Keyword::For) {
                    Some(self.hash_blob()?)
                } else {
                    None
                };
                Ok(Statement::Show(Show::Databases { for_user }))
            }
            token => Err(SqlError::Parse(format!(
                "expected TABLES, DATABASES, GRANTS or ALL, got {token}"
            ))),
        }
    }

    fn grant_clause(&mut self) -> Result<(PrivilegeSpec, Option<Hash>)> {
        let kind = match self.next()? {
            Token::Keyword(Keyword::Create) => PrivilegeKind::Create,
            Token::Keyword(Keyword::Delete) => PrivilegeKind::Delete,
            Token::Keyword(Keyword::Drop) => PrivilegeKind::Drop,
            Token::Keyword(Keyword::Insert) => PrivilegeKind::Insert,
            Token::Keyword(Keyword::Update) => PrivilegeKind::Update,
            Token::Keyword(Keyword::Grant) => PrivilegeKind::Grant,
            Token::Identifier(word) if word == "template" => {
                PrivilegeKind::Template(self.hash_blob()?)
            }
            token => Err(SqlError::Parse(format!(
                "expected privilege kind, got {token}"
            )))?,
        };
        let table = if self.accept_keyword(Keyword::On) {
            Some(self.identifier()?)
        } else {
            None
        };
        self.expect_keyword(Keyword::To)?;
        let user = match self.next()? {
            Token::Keyword(Keyword::Null) => None,
            Token::Blob(bytes) => {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| SqlError::Parse("expected a 32-byte user hash".into()))?;
                Some(Hash::from_bytes(arr))
            }
            token => {
                return Err(SqlError::Parse(format!(
                    "expected user hash or NULL, got {token}"
                )))
            }
        };
        Ok((PrivilegeSpec { kind, table }, user))
    }

    fn if_statement(&mut self) -> Result<Statement> {
        let mut branches = Vec::new();
        let mut otherwise = None;

        let condition = self.expression()?;
        self.expect_keyword(Keyword::Then)?;
        let body = self.descend(|p| p.statement())?;
        Self::require_mutating(&body)?;
        branches.push((condition, body));

        loop {
            if self.accept_keyword(Keyword::End) {
                break;
            }
            self.expect_keyword(Keyword::Else)?;
            if self.accept_keyword(Keyword::If) {
                let condition = self.expression()?;
                self.expect_keyword(Keyword::Then)?;
                let body = self.descend(|p| p.statement())?;
                Self::require_mutating(&body)?;
                branches.push((condition, body));
            } else {
                let body = self.descend(|p| p.statement())?;
                Self::require_mutating(&body)?;
                otherwise = Some(Box::new(body));
                self.expect_keyword(Keyword::End)?;
                break;
            }
        }

        Ok(Statement::If {
            branches,
            otherwise,
        })
    }

    fn block(&mut self) -> Result<Statement> {
        let mut statements = Vec::new();
        loop {
            if self.accept_keyword(Keyword::End) {
                break;
            }
            let statement = self.descend(|p| p.statement())?;
            self.expect(&Token::Semicolon)?;
            statements.push(statement);
        }
        if statements.is_empty() {
            return Err(SqlError::Parse("empty DO block".into()));
        }
        Ok(Statement::Block(statements))
    }

    fn require_mutating(statement: &Statement) -> Result<()> {
        if statement.is_mutating() {
            Ok(())
        } else {
            Err(SqlError::Parse(
                "IF branches must be mutating statements".into(),
            ))
        }
    }

    fn data_type(&mut self) -> Result<DataType> {
        match self.next()? {
            Token::Keyword(Keyword::Text) => Ok(DataType::Text),
            Token::Keyword(Keyword::Int) => Ok(DataType::Int),
            Token::Keyword(Keyword::Blob) => Ok(DataType::Blob),
            token => Err(SqlError::Parse(format!(
                "expected TEXT, INT or BLOB, got {token}"
            ))),
        }
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<Expression> {
        self.or_expression()
    }

    fn or_expression(&mut self) -> Result<Expression> {
        let mut left = self.and_expression()?;
        while self.accept_keyword(Keyword::Or) {
            let right = self.and_expression()?;
            left = Expression::Binary {
                op: BinaryOperator::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expression(&mut self) -> Result<Expression> {
        let mut left = self.not_expression()?;
        while self.accept_keyword(Keyword::And) {
            let right = self.not_expression()?;
            left = Expression::Binary {
                op: BinaryOperator::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expression(&mut self) -> Result<Expression> {
        if self.accept_keyword(Keyword::Not) {
            let expr = self.not_expression()?;
            return Ok(Expression::Unary {
                op: UnaryOperator::Not,
                expr: Box::new(expr),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expression> {
        let left = self.additive()?;
        if self.accept_keyword(Keyword::Is) {
            self.expect_keyword(Keyword::Null)?;
            return Ok(Expression::Unary {
                op: UnaryOperator::IsNull,
                expr: Box::new(left),
            });
        }
        let op = match self.peek() {
            Some(Token::Equal) => BinaryOperator::Equal,
            Some(Token::NotEqual) => BinaryOperator::NotEqual,
            Some(Token::Less) => BinaryOperator::Less,
            Some(Token::Greater) => BinaryOperator::Greater,
            Some(Token::LessOrEqual) => BinaryOperator::LessOrEqual,
            Some(Token::GreaterOrEqual) => BinaryOperator::GreaterOrEqual,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn additive(&mut self) -> Result<Expression> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOperator::Add,
                Some(Token::Minus) => BinaryOperator::Subtract,
                Some(Token::Concat) => BinaryOperator::Concat,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expression> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Asterisk) => BinaryOperator::Multiply,
                Some(Token::Slash) => BinaryOperator::Divide,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression> {
        if self.accept(&Token::Minus) {
            let expr = self.unary()?;
            return Ok(Expression::Unary {
                op: UnaryOperator::Negate,
                expr: Box::new(expr),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expression> {
        match self.next()? {
            Token::Integer(n) => Ok(Expression::Literal(Literal::Int(n))),
            Token::String(s) => Ok(Expression::Literal(Literal::Text(s))),
            Token::Blob(b) => Ok(Expression::Literal(Literal::Blob(b))),
            Token::Keyword(Keyword::Null) => Ok(Expression::Literal(Literal::Null)),
            Token::Variable(name) => Ok(Expression::Variable(name)),
            Token::Parameter { name, value } => match value {
                Some(literal) => Ok(Expression::BoundParameter(name, literal)),
                None => Ok(Expression::UnboundParameter(name)),
            },
            Token::OpenParen => self.descend(|p| {
                let expr = p.expression()?;
                p.expect(&Token::CloseParen)?;
                Ok(expr)
            }),
            Token::Keyword(Keyword::Case) => self.descend(|p| p.case()),
            Token::Keyword(Keyword::Exists) => self.descend(|p| {
                p.expect(&Token::OpenParen)?;
                p.expect_keyword(Keyword::Select)?;
                let select = p.select()?;
                p.expect(&Token::CloseParen)?;
                Ok(Expression::Exists(Box::new(select)))
            }),
            Token::Identifier(name) => {
                if self.accept(&Token::OpenParen) {
                    self.descend(|p| {
                        let mut arguments = Vec::new();
                        if !p.accept(&Token::CloseParen) {
                            loop {
                                arguments.push(p.expression()?);
                                if !p.accept(&Token::Comma) {
                                    break;
                                }
                            }
                            p.expect(&Token::CloseParen)?;
                        }
                        Ok(Expression::Call {
                            function: name,
                            arguments,
                        })
                    })
                } else {
                    Ok(Expression::Column(name))
                }
            }
            token => Err(SqlError::Parse(format!(
                "expected expression, got {token}"
            ))),
        }
    }

    fn case(&mut self) -> Result<Expression> {
        let mut branches = Vec::new();
        self.expect_keyword(Keyword::When)?;
        loop {
            let condition = self.expression()?;
            self.expect_keyword(Keyword::Then)?;
            let value = self.expression()?;
            branches.push((condition, value));
            if !self.accept_keyword(Keyword::When) {
                break;
            }
        }
        let otherwise = if self.accept_keyword(Keyword::Else) {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        self.expect_keyword(Keyword::End)?;
        Ok(Expression::Case {
            branches,
            otherwise,
        })
    }
}
