//! Formula compilation and validation.
//!
//! A formula is a user-supplied arithmetic expression over the single
//! variable `x`, e.g. `50*sinh(x)` or `x**2 - 3*cos(x)`. It is tokenized and
//! parsed into a small typed AST here; evaluation only ever walks that AST,
//! so user text can never reach anything besides the whitelisted math
//! functions below.

/// Formula active at startup when neither the CLI nor the config file
/// picks one.
pub const DEFAULT_FORMULA: &str = "50*sinh(x)";

/// Number of samples used to probe a candidate formula for numeric
/// well-behavedness before accepting it.
const PROBE_POINTS: usize = 10;

/// Probe domain start. Chosen above zero so `log` and `sqrt` of plain `x`
/// stay defined.
const PROBE_START: f64 = 0.1;
const PROBE_END: f64 = 10.0;

/// Errors produced while validating a formula.
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaError {
    /// The formula contains identifiers that are neither `x` nor a
    /// whitelisted function/constant.
    UnknownIdentifiers(Vec<String>),
    /// The formula does not parse as a pure arithmetic expression.
    Syntax(String),
    /// The formula evaluated to NaN or infinity somewhere on the probe
    /// domain.
    NonFinite,
}

impl std::fmt::Display for FormulaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormulaError::UnknownIdentifiers(names) => {
                write!(
                    f,
                    "Unknown identifier(s): {}. Available: {} and the variable 'x'",
                    names.join(", "),
                    Function::NAMES.join(", ")
                )
            }
            FormulaError::Syntax(msg) => write!(f, "Invalid formula syntax: {}", msg),
            FormulaError::NonFinite => {
                write!(f, "Formula produces non-finite values (division by zero, log of a non-positive number, ...)")
            }
        }
    }
}

impl std::error::Error for FormulaError {}

/// Whitelisted single-argument functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Sin,
    Cos,
    Tan,
    Arcsin,
    Arccos,
    Arctan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Sqrt,
}

impl Function {
    /// All accepted identifiers, functions and constants alike, for error
    /// messages.
    const NAMES: [&'static str; 14] = [
        "sin", "cos", "tan", "arcsin", "arccos", "arctan", "sinh", "cosh", "tanh", "pi", "e",
        "exp", "log", "sqrt",
    ];

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Self::Sin),
            "cos" => Some(Self::Cos),
            "tan" => Some(Self::Tan),
            "arcsin" => Some(Self::Arcsin),
            "arccos" => Some(Self::Arccos),
            "arctan" => Some(Self::Arctan),
            "sinh" => Some(Self::Sinh),
            "cosh" => Some(Self::Cosh),
            "tanh" => Some(Self::Tanh),
            "exp" => Some(Self::Exp),
            "log" => Some(Self::Log),
            "sqrt" => Some(Self::Sqrt),
            _ => None,
        }
    }

    fn apply(self, v: f64) -> f64 {
        match self {
            Self::Sin => v.sin(),
            Self::Cos => v.cos(),
            Self::Tan => v.tan(),
            Self::Arcsin => v.asin(),
            Self::Arccos => v.acos(),
            Self::Arctan => v.atan(),
            Self::Sinh => v.sinh(),
            Self::Cosh => v.cosh(),
            Self::Tanh => v.tanh(),
            Self::Exp => v.exp(),
            Self::Log => v.ln(),
            Self::Sqrt => v.sqrt(),
        }
    }
}

/// Is this identifier acceptable in a formula?
fn is_known_identifier(name: &str) -> bool {
    name == "x" || name == "pi" || name == "e" || Function::from_name(name).is_some()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Pow,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", n),
            Token::Ident(s) => format!("'{}'", s),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::Pow => "'**'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
        }
    }
}

/// Split formula text into tokens. Whitespace is insignificant; `^` is a
/// synonym for `**`.
fn tokenize(text: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Pow);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '^' => {
                tokens.push(Token::Pow);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Optional exponent suffix: 1e3, 2.5e-4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    FormulaError::Syntax(format!("malformed number '{}'", literal))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(FormulaError::Syntax(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

/// Collect identifiers outside the whitelist, preserving first-seen order.
fn unknown_identifiers(tokens: &[Token]) -> Vec<String> {
    let mut unknown: Vec<String> = Vec::new();
    for token in tokens {
        if let Token::Ident(name) = token {
            if !is_known_identifier(name) && !unknown.iter().any(|n| n == name) {
                unknown.push(name.clone());
            }
        }
    }
    unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Typed expression tree. Evaluation is a direct walk of this enum; there is
/// no other execution path.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var,
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    fn eval(&self, x: f64) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Var => x,
            Expr::Neg(inner) => -inner.eval(x),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(x);
                let r = rhs.eval(x);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Pow => l.powf(r),
                }
            }
            Expr::Call(func, arg) => func.apply(arg.eval(x)),
        }
    }
}

/// Recursive-descent parser over the token stream.
///
/// Grammar (loosest to tightest binding):
/// ```text
/// expression := term { ('+' | '-') term }
/// term       := unary { ('*' | '/') unary }
/// unary      := ('-' | '+') unary | power
/// power      := atom [ '**' unary ]        (right-associative)
/// atom       := number | 'x' | 'pi' | 'e' | func '(' expression ')'
///             | '(' expression ')'
/// ```
/// `**` binding tighter than unary minus on its left matches the original
/// tool: `-x**2` is `-(x**2)`, and `2**-3` is accepted.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse(tokens: &'a [Token]) -> Result<Expr, FormulaError> {
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        match parser.peek() {
            None => Ok(expr),
            Some(tok) => Err(FormulaError::Syntax(format!(
                "unexpected {} after expression",
                tok.describe()
            ))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, context: &str) -> Result<(), FormulaError> {
        match self.advance() {
            Some(tok) if *tok == expected => Ok(()),
            Some(tok) => Err(FormulaError::Syntax(format!(
                "expected {} {}, found {}",
                expected.describe(),
                context,
                tok.describe()
            ))),
            None => Err(FormulaError::Syntax(format!(
                "expected {} {}, found end of formula",
                expected.describe(),
                context
            ))),
        }
    }

    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Pow) {
            self.advance();
            // Right-associative; the exponent may carry its own sign.
            let exponent = self.unary()?;
            Ok(Expr::Binary(
                BinOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ))
        } else {
            Ok(base)
        }
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        let token = match self.advance() {
            Some(tok) => tok.clone(),
            None => {
                return Err(FormulaError::Syntax(
                    "unexpected end of formula".to_string(),
                ))
            }
        };
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "to close parenthesis")?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "x" => Ok(Expr::Var),
                "pi" => Ok(Expr::Number(std::f64::consts::PI)),
                "e" => Ok(Expr::Number(std::f64::consts::E)),
                _ => {
                    // Identifier scan ran before parsing, so this is a
                    // whitelisted function name.
                    let func = Function::from_name(&name).ok_or_else(|| {
                        FormulaError::UnknownIdentifiers(vec![name.clone()])
                    })?;
                    self.expect(Token::LParen, &format!("after function '{}'", name))?;
                    let arg = self.expression()?;
                    self.expect(Token::RParen, &format!("to close call to '{}'", name))?;
                    Ok(Expr::Call(func, Box::new(arg)))
                }
            },
            other => Err(FormulaError::Syntax(format!(
                "unexpected {}",
                other.describe()
            ))),
        }
    }
}

/// A validated formula: the original text plus its compiled evaluator.
///
/// The identity formula (empty text) maps every sample to 0, i.e. no
/// distortion.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    text: String,
    expr: Option<Expr>,
}

impl Default for Formula {
    fn default() -> Self {
        Self::identity()
    }
}

impl Formula {
    /// The identity formula: evaluates to 0 everywhere, never fails.
    pub fn identity() -> Self {
        Formula {
            text: String::new(),
            expr: None,
        }
    }

    /// Validate and compile formula text.
    ///
    /// Blank text yields the identity formula. Otherwise the text must
    /// tokenize with only whitelisted identifiers, parse as a pure
    /// arithmetic expression, and evaluate to finite values over the whole
    /// probe domain (10 samples over [0.1, 10], so e.g. `log(x-5)` and
    /// `arcsin(x)` are rejected).
    ///
    /// # Errors
    /// `FormulaError` describing the offending identifiers, the syntax
    /// problem, or the non-finite probe result.
    pub fn compile(text: &str) -> Result<Self, FormulaError> {
        if text.trim().is_empty() {
            return Ok(Self::identity());
        }

        let tokens = tokenize(text)?;

        let unknown = unknown_identifiers(&tokens);
        if !unknown.is_empty() {
            return Err(FormulaError::UnknownIdentifiers(unknown));
        }

        let expr = Parser::parse(&tokens)?;

        for x in probe_domain() {
            if !expr.eval(x).is_finite() {
                return Err(FormulaError::NonFinite);
            }
        }

        Ok(Formula {
            text: text.to_string(),
            expr: Some(expr),
        })
    }

    /// The formula text as submitted (empty for the identity formula).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True for the identity (no-distortion) formula.
    pub fn is_identity(&self) -> bool {
        self.expr.is_none()
    }

    /// Evaluate the formula over a slice of sample points.
    ///
    /// The identity formula yields all zeros. Individual results may be
    /// non-finite outside the probe domain; callers sanitize as needed.
    pub fn eval(&self, xs: &[f64]) -> Vec<f64> {
        match &self.expr {
            Some(expr) => xs.iter().map(|&x| expr.eval(x)).collect(),
            None => vec![0.0; xs.len()],
        }
    }
}

fn probe_domain() -> Vec<f64> {
    let step = (PROBE_END - PROBE_START) / (PROBE_POINTS - 1) as f64;
    (0..PROBE_POINTS)
        .map(|i| PROBE_START + step * i as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_one(text: &str, x: f64) -> f64 {
        let formula = Formula::compile(text).expect("formula should compile");
        formula.eval(&[x])[0]
    }

    #[test]
    fn test_compile_default_formula() {
        let formula = Formula::compile(DEFAULT_FORMULA).unwrap();
        assert_eq!(formula.text(), "50*sinh(x)");
        assert!(!formula.is_identity());
    }

    #[test]
    fn test_empty_text_is_identity() {
        let formula = Formula::compile("").unwrap();
        assert!(formula.is_identity());
        assert_eq!(formula.eval(&[1.0, 2.0, 3.0]), vec![0.0, 0.0, 0.0]);

        let formula = Formula::compile("   ").unwrap();
        assert!(formula.is_identity());
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_one("2+3*4", 0.0), 14.0);
        assert_eq!(eval_one("(2+3)*4", 0.0), 20.0);
        assert_eq!(eval_one("10-4-3", 0.0), 3.0);
        assert_eq!(eval_one("12/4/3", 0.0), 1.0);
    }

    #[test]
    fn test_power_right_associative() {
        // 2**3**2 = 2**(3**2) = 512, not (2**3)**2 = 64
        assert_eq!(eval_one("2**3**2", 0.0), 512.0);
    }

    #[test]
    fn test_power_binds_tighter_than_unary_minus() {
        // -x**2 at x=3 is -(3^2) = -9
        assert_eq!(eval_one("-x**2", 3.0), -9.0);
        // Negative exponents are allowed
        assert_eq!(eval_one("2**-1", 0.0), 0.5);
    }

    #[test]
    fn test_caret_is_power_synonym() {
        assert_eq!(eval_one("x^2", 5.0), 25.0);
        assert_eq!(eval_one("x**2", 5.0), 25.0);
    }

    #[test]
    fn test_whitespace_insignificant() {
        assert_eq!(eval_one("  50 * sinh( x )  ", 1.0), eval_one("50*sinh(x)", 1.0));
    }

    #[test]
    fn test_constants() {
        assert!((eval_one("pi", 0.0) - std::f64::consts::PI).abs() < 1e-12);
        assert!((eval_one("e", 0.0) - std::f64::consts::E).abs() < 1e-12);
        // 'e' as a constant coexists with exponent notation in numbers
        assert_eq!(eval_one("1e3", 0.0), 1000.0);
        assert_eq!(eval_one("2.5e-1", 0.0), 0.25);
    }

    #[test]
    fn test_functions_evaluate() {
        assert!((eval_one("sin(pi/2)", 0.0) - 1.0).abs() < 1e-12);
        assert!((eval_one("cos(x)", 0.0) - 1.0).abs() < 1e-12);
        assert!((eval_one("sqrt(x)", 16.0) - 4.0).abs() < 1e-12);
        assert!((eval_one("log(e)", 0.0) - 1.0).abs() < 1e-12);
        assert!((eval_one("exp(1)", 0.0) - std::f64::consts::E).abs() < 1e-12);
        assert!((eval_one("tanh(x)", 100.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_identifiers_all_reported() {
        let err = Formula::compile("foo(x) + bar*2 + sin(x)").unwrap_err();
        match err {
            FormulaError::UnknownIdentifiers(names) => {
                assert_eq!(names, vec!["foo".to_string(), "bar".to_string()]);
            }
            other => panic!("expected UnknownIdentifiers, got {:?}", other),
        }
    }

    #[test]
    fn test_misspelled_function_rejected() {
        // The original's canonical typo examples
        assert!(matches!(
            Formula::compile("sin1(x)"),
            Err(FormulaError::UnknownIdentifiers(_))
        ));
        assert!(matches!(
            Formula::compile("log2(x)"),
            Err(FormulaError::UnknownIdentifiers(_))
        ));
    }

    #[test]
    fn test_error_message_lists_available_names() {
        let err = Formula::compile("frobnicate(x)").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("frobnicate"));
        assert!(msg.contains("sinh"));
        assert!(msg.contains("'x'"));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            Formula::compile("2+"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::compile("(x+1"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::compile("sin x"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::compile("x 2"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::compile("x = 2"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::compile("x.sin()"),
            Err(FormulaError::Syntax(_))
        ));
    }

    #[test]
    fn test_probe_rejects_non_finite() {
        // arcsin is undefined for most of [0.1, 10]
        assert_eq!(Formula::compile("arcsin(x)"), Err(FormulaError::NonFinite));
        // log of a negative number
        assert_eq!(Formula::compile("log(x-5)"), Err(FormulaError::NonFinite));
        // division by an expression that is zero everywhere
        assert_eq!(Formula::compile("1/(0*x)"), Err(FormulaError::NonFinite));
        // plain overflow
        assert_eq!(
            Formula::compile("exp(exp(exp(x)))"),
            Err(FormulaError::NonFinite)
        );
    }

    #[test]
    fn test_probe_accepts_finite_edge_cases() {
        // 1/cos(x) spikes near cos(x)=0 but stays finite at every one of the
        // ten probe samples, so it is accepted.
        assert!(Formula::compile("1/cos(x)").is_ok());
        // log(x) is fine: the probe domain starts at 0.1
        assert!(Formula::compile("log(x)").is_ok());
    }

    #[test]
    fn test_accepted_formula_is_finite_over_probe_domain() {
        for text in ["50*sinh(x)", "x**2", "1/cos(x)", "sqrt(x)+log(x)", "tan(x)"] {
            let formula = Formula::compile(text).unwrap();
            for y in formula.eval(&probe_domain()) {
                assert!(y.is_finite(), "{} probed to non-finite {}", text, y);
            }
        }
    }

    #[test]
    fn test_function_without_call_rejected() {
        assert!(matches!(
            Formula::compile("sin"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(matches!(
            Formula::compile("sin + 1"),
            Err(FormulaError::Syntax(_))
        ));
    }

    #[test]
    fn test_probe_domain_shape() {
        let domain = probe_domain();
        assert_eq!(domain.len(), 10);
        assert!((domain[0] - 0.1).abs() < 1e-12);
        assert!((domain[9] - 10.0).abs() < 1e-12);
    }
}
