use malachite::num::arithmetic::traits::Lcm;
use malachite::num::basic::traits::One;
use malachite::Natural;
use mendeleev::ALL_ELEMENTS;
use std::collections::BTreeMap;
use std::iter::{zip, Peekable};
use std::str::CharIndices;
use thiserror::Error;





/// Characters that may separate the two sides of an equation (`=`, `->`, `<->`, `>`)
pub const SEPARATOR_CHARS: [char; 4] = ['=', '<', '>', '-'];

/// Subscript markup characters that are skipped while tokenizing (`H_{2}O` is read as `H2O`)
pub const MARKUP_CHARS: [char; 3] = ['_', '{', '}'];

/// Deepest bracket nesting accepted by the tokenizer
pub const MAX_NESTING: usize = 64;

/// Values whose magnitude is at most this are treated as zero
pub const DEFAULT_EPSILON: f64 = 1e-10;

/// Largest denominator tried when turning a solution entry into a fraction
pub const DEFAULT_MAX_DENOMINATOR: u64 = 100_000;





/// Errors that can occur while parsing or balancing an equation
#[derive(Clone, Debug, Eq, Hash, PartialEq, Error)]
pub enum BalanceError {
    /// Equation does not split into exactly two non-empty sides, or a side has an empty term
    #[error("Equation must have exactly two non-empty sides")]
    MalformedEquation,
    /// No element symbol appears anywhere in the equation
    #[error("Equation does not contain any elements")]
    NoCommonElements,
    /// The stoichiometry matrix has no one-dimensional null space
    #[error("No solution")]
    NoSolution,
    /// The solution entry at `index` is not a fraction with a small enough denominator
    #[error("Solution entry {index} cannot be written as a fraction within the denominator bound")]
    Unnormalizable { index: usize },
    /// An atom count, multiplier or balanced coefficient does not fit in 64 bits
    #[error("Count does not fit in 64 bits")]
    Overflow,
    /// Solution was calculated, but is invalid (non-positive or not conserving atoms)
    #[error("Invalid solution")]
    InvalidSolution,
    /// Entered element is not in the periodic table (only checked when validation is enabled)
    #[error("Invalid element: {0}")]
    UnknownElement(String),
    /// Brackets are nested deeper than the tokenizer allows
    #[error("Brackets nested deeper than {limit} levels")]
    NestingTooDeep { limit: usize },
}

/// Tunable constants used while balancing
/// # Example
/// ```
/// use chembalance::{balance_with, BalanceOptions};
///
/// let options = BalanceOptions { validate_elements: true, ..BalanceOptions::default() };
/// assert_eq!(balance_with("Fe + O2 = Fe2O3", &options).unwrap(), vec![4, 3, 2]);
/// ```
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BalanceOptions {
    /// Tolerance below which a matrix entry is zero and a scaled entry is an integer
    pub epsilon: f64,
    /// Upper bound (inclusive) of the per-entry denominator search
    pub max_denominator: u64,
    /// Reject symbols that are not real elements
    pub validate_elements: bool,
}
impl Default for BalanceOptions {
    fn default() -> Self {
        BalanceOptions {
            epsilon: DEFAULT_EPSILON,
            max_denominator: DEFAULT_MAX_DENOMINATOR,
            validate_elements: false,
        }
    }
}





/// Mapping from element symbol to the total number of atoms
pub type ElementCounts = BTreeMap<String, u64>;

/// One node of a tokenized formula
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FormulaNode {
    /// Single element with its subscript, e.g. `O2`
    Element { symbol: String, count: u64 },
    /// Bracketed group with its multiplier, e.g. `(OH)2`
    Group { text: String, children: Vec<FormulaNode>, count: u64 },
}
impl FormulaNode {
    /// Returns the subscript of an element or the multiplier of a group
    pub fn count(&self) -> u64 {
        match self {
            FormulaNode::Element { count, .. } | FormulaNode::Group { count, .. } => *count,
        }
    }

    /// Returns the number of atoms of every element beneath this node, multiplied by its count
    /// Fails with `Overflow` if a total does not fit in `u64`
    pub fn element_counts(&self) -> Result<ElementCounts, BalanceError> {
        let mut counts = ElementCounts::new();
        match self {
            FormulaNode::Element { symbol, count } => add_atoms(&mut counts, symbol, *count)?,
            FormulaNode::Group { children, count, .. } => {
                for (symbol, quantity) in sum_nodes(children)? {
                    let quantity = quantity.checked_mul(*count).ok_or(BalanceError::Overflow)?;
                    add_atoms(&mut counts, &symbol, quantity)?;
                }
            },
        }
        Ok(counts)
    }
}

/// Splits formula into a tree of elements and bracketed groups
/// Subscript markup (`_`, `{`, `}`) is skipped, `[` and `]` work the same as `(` and `)`
/// Digits in front of the first element (coefficients) are ignored
/// # Arguments
/// * `formula` - formula string (e.g. `Mg(OH)2`)
/// # Returns
/// * `Ok` - top level nodes of the formula
/// * `Err` - brackets are nested too deeply, or a subscript does not fit in `u64`
/// # Example
/// ```
/// use chembalance::{tokenize, FormulaNode};
///
/// let nodes = tokenize("Mg(OH)2").unwrap();
///
/// assert_eq!(nodes, vec![
///     FormulaNode::Element { symbol: String::from("Mg"), count: 1 },
///     FormulaNode::Group {
///         text: String::from("OH"),
///         children: vec![
///             FormulaNode::Element { symbol: String::from("O"), count: 1 },
///             FormulaNode::Element { symbol: String::from("H"), count: 1 },
///         ],
///         count: 2,
///     },
/// ]);
/// ```
pub fn tokenize(formula: &str) -> Result<Vec<FormulaNode>, BalanceError> {
    let formula = formula.replace(r"\left", "").replace(r"\right", "");
    let mut tokenizer = Tokenizer { text: &formula, chars: formula.char_indices().peekable() };
    let (nodes, _) = tokenizer.parse_sequence(0)?;
    Ok(nodes)
}

/// Counts atoms of every element in formula, expanding bracketed groups
/// # Arguments
/// * `formula` - formula string
/// # Returns
/// * `Ok` - element counts
/// * `Err` - formula could not be tokenized, or an atom count does not fit in `u64`
/// # Example
/// ```
/// use chembalance::decompose;
/// use std::collections::BTreeMap;
///
/// let counts = decompose("K4[Fe(CN)6]").unwrap();
///
/// let expected = BTreeMap::from([
///     (String::from("C"), 6),
///     (String::from("Fe"), 1),
///     (String::from("K"), 4),
///     (String::from("N"), 6),
/// ]);
/// assert_eq!(counts, expected);
/// ```
pub fn decompose(formula: &str) -> Result<ElementCounts, BalanceError> {
    sum_nodes(&tokenize(formula)?)
}

fn sum_nodes(nodes: &[FormulaNode]) -> Result<ElementCounts, BalanceError> {
    let mut counts = ElementCounts::new();
    for node in nodes {
        for (symbol, quantity) in node.element_counts()? {
            add_atoms(&mut counts, &symbol, quantity)?;
        }
    }
    Ok(counts)
}

fn add_atoms(counts: &mut ElementCounts, symbol: &str, quantity: u64) -> Result<(), BalanceError> {
    let total = counts.entry(symbol.to_string()).or_insert(0);
    *total = total.checked_add(quantity).ok_or(BalanceError::Overflow)?;
    Ok(())
}

/// Appends `digit` to a decimal count, failing with `Overflow` past `u64::MAX`
fn push_decimal(count: Option<u64>, digit: u64) -> Result<u64, BalanceError> {
    count.unwrap_or(0)
        .checked_mul(10)
        .and_then(|count| count.checked_add(digit))
        .ok_or(BalanceError::Overflow)
}

fn atoms_of(counts: &ElementCounts, symbol: &str) -> u64 {
    counts.get(symbol).copied().unwrap_or(0)
}

/// Element that has been started but not yet pushed to its sibling list
#[derive(Default)]
struct PendingElement {
    symbol: String,
    count: Option<u64>,
}
impl PendingElement {
    fn push_digit(&mut self, digit: u64) -> Result<(), BalanceError> {
        self.count = Some(push_decimal(self.count, digit)?);
        Ok(())
    }

    /// Pushes the element (if any) into `nodes`, a missing or zero subscript counts as 1
    /// The pending count is always reset, which is what drops leading coefficients
    fn flush_into(&mut self, nodes: &mut Vec<FormulaNode>) {
        if !self.symbol.is_empty() {
            nodes.push(FormulaNode::Element {
                symbol: std::mem::take(&mut self.symbol),
                count: self.count.filter(|&count| count > 0).unwrap_or(1),
            });
        }
        self.count = None;
    }
}

struct Tokenizer<'a> {
    text: &'a str,
    chars: Peekable<CharIndices<'a>>,
}
impl Tokenizer<'_> {
    /// Parses nodes until the closing bracket of the current level (or end of input)
    /// Returns the nodes and the byte position of the closing bracket if one was found
    fn parse_sequence(&mut self, depth: usize) -> Result<(Vec<FormulaNode>, Option<usize>), BalanceError> {
        let mut nodes = Vec::new();
        let mut pending = PendingElement::default();

        while let Some((pos, c)) = self.chars.next() {
            match c {
                c if MARKUP_CHARS.contains(&c) => {},
                'A'..='Z' => {
                    pending.flush_into(&mut nodes);
                    pending.symbol.push(c);
                },
                'a'..='z' => pending.symbol.push(c),
                '0'..='9' => pending.push_digit(u64::from(c) - u64::from('0'))?,
                '(' | '[' => {
                    pending.flush_into(&mut nodes);
                    if depth + 1 > MAX_NESTING { return Err(BalanceError::NestingTooDeep { limit: MAX_NESTING }); }

                    let start = pos + c.len_utf8();
                    let (children, end) = self.parse_sequence(depth + 1)?;
                    let end = end.unwrap_or(self.text.len());  // unclosed group ends with the input
                    let text = self.text[start..end].chars().filter(|c| !MARKUP_CHARS.contains(c)).collect();
                    let count = self.parse_multiplier()?;

                    nodes.push(FormulaNode::Group { text, children, count });
                },
                ')' | ']' => {
                    pending.flush_into(&mut nodes);
                    if depth > 0 { return Ok((nodes, Some(pos))); }
                    // stray closing bracket at top level is skipped
                },
                _ => {},
            }
        }

        pending.flush_into(&mut nodes);
        Ok((nodes, None))
    }

    /// Reads digits directly after a closing bracket, markup in between is allowed (`(OH)_{2}`)
    fn parse_multiplier(&mut self) -> Result<u64, BalanceError> {
        let mut count: Option<u64> = None;
        while let Some(&(_, c)) = self.chars.peek() {
            if MARKUP_CHARS.contains(&c) {
                self.chars.next();
            } else if let Some(digit) = c.to_digit(10) {
                count = Some(push_decimal(count, u64::from(digit))?);
                self.chars.next();
            } else {
                break;
            }
        }
        Ok(count.filter(|&count| count > 0).unwrap_or(1))
    }
}





/// A struct that represents a chemical equation (e.g. H2 + O2 = H2O)
#[derive(Clone, Debug, PartialEq)]
pub struct Equation {
    /// String from which the equation was parsed
    original_str: String,
    /// Separator characters found in the equation, reused when printing the solution
    separator: String,
    /// A vector of reactants
    reactants: Vec<Compound>,
    /// A vector of products
    products: Vec<Compound>,
    /// A vector of solutions for reactants (stoichiometric coefficients)
    solutions_reactants: Option<Vec<i64>>,
    /// A vector of solutions for products (stoichiometric coefficients)
    solutions_products: Option<Vec<i64>>,
}
impl Equation {
    /// Parses equation of the form `A + ... + B = C + ... + D`
    /// Sides can also be separated by `->`, `<->` or `>`
    /// # Arguments
    /// * `input` - equation string
    /// # Returns
    /// * `Ok` - equation
    /// * `Err` - error that occurred during parsing
    /// # Example
    /// ```
    /// use chembalance::{Compound, Equation};
    ///
    /// let equation = Equation::parse("H2 + O2 -> H2O").unwrap();
    ///
    /// assert_eq!(equation.separator(), "->");
    /// assert_eq!(equation.reactants(), &[Compound::parse("H2").unwrap(), Compound::parse("O2").unwrap()]);
    /// assert_eq!(equation.products(), &[Compound::parse("H2O").unwrap()]);
    /// ```
    pub fn parse(input: &str) -> Result<Self, BalanceError> {
        let separator = input.chars().filter(|c| SEPARATOR_CHARS.contains(c)).collect::<String>();

        // reduce arrows to a single '='
        let normalized = input.replacen('>', "=", 1).replacen('-', "", 1).replacen('<', "", 1);

        let sides = normalized.split('=').collect::<Vec<&str>>();
        let [reactants_str, products_str] = sides[..] else { return Err(BalanceError::MalformedEquation); };
        if reactants_str.trim().is_empty() || products_str.trim().is_empty() {
            return Err(BalanceError::MalformedEquation);
        }

        let process_side = |side: &str| -> Result<Vec<Compound>, BalanceError> {
            side.split('+')
                .map(str::trim)
                .map(|term| if term.is_empty() { Err(BalanceError::MalformedEquation) } else { Compound::parse(term) })
                .collect()
        };

        Ok(Self {
            original_str: input.to_string(),
            separator,
            reactants: process_side(reactants_str)?,
            products: process_side(products_str)?,
            solutions_reactants: None,
            solutions_products: None,
        })
    }

    /// Solves the equation with default options
    /// # Returns
    /// * `Ok` - if the equation was solved successfully
    /// * `Err` - if the equation was not solved successfully
    pub fn solve(&mut self) -> Result<(), BalanceError> {
        self.solve_with(&BalanceOptions::default())
    }

    /// Solves the equation
    /// # Arguments
    /// * `options` - tolerances and validation settings
    /// # Returns
    /// * `Ok` - if the equation was solved successfully
    /// * `Err` - if the equation was not solved successfully
    /// # Example
    /// ```
    /// use chembalance::{BalanceError, BalanceOptions, Equation};
    ///
    /// let options = BalanceOptions { validate_elements: true, ..BalanceOptions::default() };
    ///
    /// let mut equation = Equation::parse("Xx + O2 = XxO2").unwrap();
    /// assert_eq!(equation.solve_with(&options), Err(BalanceError::UnknownElement(String::from("Xx"))));
    ///
    /// let mut equation = Equation::parse("Na + Cl2 = NaCl").unwrap();
    /// equation.solve_with(&options).unwrap();
    /// assert_eq!(equation.coefficients().unwrap(), vec![2, 1, 2]);
    /// ```
    pub fn solve_with(&mut self, options: &BalanceOptions) -> Result<(), BalanceError> {
        if options.validate_elements {
            self.validate_elements()?;
        }

        let matrix = self.matrix()?;
        let solution = solve_null_space(&matrix, options.epsilon)?;
        let solutions = normalize(&solution, options)?;
        if solutions.iter().any(|x| *x <= 0) { return Err(BalanceError::InvalidSolution); }

        let (reactants_solutions, products_solutions) = solutions.split_at(self.reactants.len());

        // check if solutions are correct
        let mut totals: BTreeMap<&str, i128> = BTreeMap::new();
        for (compounds, coeffs, sign) in [(&self.reactants, reactants_solutions, 1), (&self.products, products_solutions, -1)] {
            for (compound, coeff) in zip(compounds.iter(), coeffs.iter()) {
                for (element, q) in compound.elements.iter() {
                    let atoms = i128::from(*q).checked_mul(i128::from(*coeff)).ok_or(BalanceError::InvalidSolution)?;
                    let total = totals.entry(element.as_str()).or_insert(0);
                    *total = total.checked_add(sign * atoms).ok_or(BalanceError::InvalidSolution)?;
                }
            }
        }
        if totals.values().any(|total| *total != 0) { return Err(BalanceError::InvalidSolution); }

        self.solutions_reactants = Some(reactants_solutions.to_vec());
        self.solutions_products = Some(products_solutions.to_vec());

        Ok(())
    }

    fn validate_elements(&self) -> Result<(), BalanceError> {
        for compound in self.reactants.iter().chain(self.products.iter()) {
            for symbol in compound.elements.keys() {
                if !ALL_ELEMENTS.iter().any(|e| e.symbol() == symbol.as_str()) {
                    return Err(BalanceError::UnknownElement(symbol.clone()));
                }
            }
        }
        Ok(())
    }

    /// Builds the stoichiometry matrix of the equation
    /// # Returns
    /// * `Ok` - matrix with one row per element and one column per compound
    /// * `Err` - equation contains no elements
    pub fn matrix(&self) -> Result<StoichiometryMatrix, BalanceError> {
        let left = self.reactants.iter().map(|c| c.elements.clone()).collect::<Vec<ElementCounts>>();
        let right = self.products.iter().map(|c| c.elements.clone()).collect::<Vec<ElementCounts>>();
        StoichiometryMatrix::build(&left, &right)
    }

    /// Returns the original string from which the equation was parsed
    pub fn original_str(&self) -> &str {
        &self.original_str
    }

    /// Returns the separator characters found in the equation (e.g. `=` or `->`)
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Returns the vector of reactants
    pub fn reactants(&self) -> &[Compound] {
        &self.reactants
    }

    /// Returns the vector of products
    pub fn products(&self) -> &[Compound] {
        &self.products
    }

    /// Returns the vector of solutions for reactants (stoichiometric coefficients)
    /// # Example
    /// ```
    /// use chembalance::Equation;
    ///
    /// let mut equation = Equation::parse("H2 + O2 = H2O").unwrap();
    /// assert_eq!(equation.solution_reactants(), None);
    ///
    /// equation.solve().unwrap();
    /// assert_eq!(equation.solution_reactants().unwrap(), &[2, 1]);
    /// ```
    pub fn solution_reactants(&self) -> Option<&Vec<i64>> {
        self.solutions_reactants.as_ref()
    }

    /// Returns the vector of solutions for products (stoichiometric coefficients)
    pub fn solution_products(&self) -> Option<&Vec<i64>> {
        self.solutions_products.as_ref()
    }

    /// Returns all coefficients, reactants first
    pub fn coefficients(&self) -> Option<Vec<i64>> {
        let sols_reacts = self.solutions_reactants.as_ref()?;
        let sols_prods = self.solutions_products.as_ref()?;
        Some(sols_reacts.iter().chain(sols_prods.iter()).copied().collect())
    }

    /// Returns the solution of the equation as a string
    /// Every compound is prefixed with its coefficient (including 1)
    /// # Example
    /// ```
    /// use chembalance::Equation;
    ///
    /// let mut equation = Equation::parse("Fe + O2 -> Fe2O3").unwrap();
    /// equation.solve().unwrap();
    ///
    /// assert_eq!(equation.solution_str().unwrap(), "4 Fe + 3 O2 -> 2 Fe2O3");
    /// ```
    pub fn solution_str(&self) -> Option<String> {
        let sols_reacts = self.solutions_reactants.as_ref()?;
        let sols_prods = self.solutions_products.as_ref()?;

        let side_str = |compounds: &[Compound], quantities: &[i64]| -> String {
            zip(compounds.iter(), quantities.iter())
                .map(|(compound, quantity)| format!("{} {}", quantity, compound.original_str))
                .collect::<Vec<String>>()
                .join(" + ")
        };

        Some(format!("{} {} {}", side_str(&self.reactants, sols_reacts), self.separator, side_str(&self.products, sols_prods)))
    }
}

/// A struct that represents a chemical compound (e.g. H2O, Mg(OH)2, ...)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Compound {
    /// String from which the compound was parsed
    original_str: String,
    /// Elements and their quantities
    elements: ElementCounts,
}
impl Compound {
    /// Create new compound from formula string
    /// # Example
    /// ```
    /// use chembalance::Compound;
    ///
    /// let compound = Compound::parse("Ca3(PO4)2").unwrap();
    ///
    /// assert_eq!(compound.original_str(), "Ca3(PO4)2");
    /// assert_eq!(compound.count_of("Ca"), 3);
    /// assert_eq!(compound.count_of("O"), 8);
    /// assert_eq!(compound.count_of("N"), 0);
    /// ```
    pub fn parse(input: &str) -> Result<Self, BalanceError> {
        Ok(Self {
            original_str: input.to_string(),
            elements: decompose(input)?,
        })
    }

    /// Returns the original string from which the compound was parsed
    pub fn original_str(&self) -> &str {
        &self.original_str
    }

    /// Returns the elements and their quantities in the compound
    pub fn elements(&self) -> &ElementCounts {
        &self.elements
    }

    /// Returns the number of atoms of `symbol`, zero if the element is absent
    pub fn count_of(&self, symbol: &str) -> u64 {
        atoms_of(&self.elements, symbol)
    }
}





/// Matrix of atom counts, one row per element and one column per compound
/// Columns of products are negated so that a balanced equation is a vector in the null space
#[derive(Clone, Debug, PartialEq)]
pub struct StoichiometryMatrix {
    /// Element of every row, in order of first appearance
    elements: Vec<String>,
    /// Number of columns (reactants + products)
    terms: usize,
    /// Matrix entries
    rows: Vec<Vec<f64>>,
}
impl StoichiometryMatrix {
    /// Builds the matrix from element counts of both sides
    /// # Arguments
    /// * `left` - element counts of reactants
    /// * `right` - element counts of products
    /// # Returns
    /// * `Ok` - matrix
    /// * `Err` - there are no elements at all
    /// # Example
    /// ```
    /// use chembalance::{decompose, StoichiometryMatrix};
    ///
    /// let left = vec![decompose("H2").unwrap(), decompose("O2").unwrap()];
    /// let right = vec![decompose("H2O").unwrap()];
    /// let matrix = StoichiometryMatrix::build(&left, &right).unwrap();
    ///
    /// assert_eq!(matrix.elements(), &["H", "O"]);
    /// assert_eq!(matrix.rows(), &[vec![2.0, 0.0, -2.0], vec![0.0, 2.0, -1.0]]);
    /// ```
    pub fn build(left: &[ElementCounts], right: &[ElementCounts]) -> Result<Self, BalanceError> {
        let mut elements: Vec<String> = Vec::new();
        for counts in left.iter().chain(right.iter()) {
            for symbol in counts.keys() {
                if !elements.contains(symbol) {
                    elements.push(symbol.clone());
                }
            }
        }
        if elements.is_empty() { return Err(BalanceError::NoCommonElements); }

        let rows = elements
            .iter()
            .map(|symbol| left
                .iter()
                .map(|counts| atoms_of(counts, symbol) as f64)
                .chain(right.iter().map(|counts| -(atoms_of(counts, symbol) as f64)))
                .collect()
            )
            .collect::<Vec<Vec<f64>>>();

        Ok(Self {
            elements,
            terms: left.len() + right.len(),
            rows,
        })
    }

    /// Returns the element of every row
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Returns the number of columns
    pub fn terms(&self) -> usize {
        self.terms
    }

    /// Returns the matrix entries
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }
}





/// Finds the null space vector of the stoichiometry matrix
/// The free column is set to 1, pivot columns are back-substituted from reduced row echelon form
/// Only one-dimensional null spaces are supported, anything else is reported as no solution
/// # Arguments
/// * `matrix` - stoichiometry matrix
/// * `epsilon` - values with smaller magnitude are treated as zero
/// # Returns
/// * `Ok` - real solution vector (one entry per compound)
/// * `Err` - there is no unique (up to scale) solution with every entry positive
/// # Example
/// ```
/// use chembalance::{decompose, solve_null_space, StoichiometryMatrix, DEFAULT_EPSILON};
///
/// let left = vec![decompose("H2").unwrap(), decompose("O2").unwrap()];
/// let right = vec![decompose("H2O").unwrap()];
/// let matrix = StoichiometryMatrix::build(&left, &right).unwrap();
///
/// assert_eq!(solve_null_space(&matrix, DEFAULT_EPSILON).unwrap(), vec![1.0, 0.5, 1.0]);
/// ```
pub fn solve_null_space(matrix: &StoichiometryMatrix, epsilon: f64) -> Result<Vec<f64>, BalanceError> {
    let mut rref = matrix.rows().to_vec();
    gaussian_elimination(&mut rref, epsilon);
    reduce_row_echelon(&mut rref, epsilon);

    let n = matrix.terms();
    let mut solution = vec![0.0; n];
    let mut last_pivot: Option<usize> = None;
    let mut pivot_count = 0;
    let mut no_solution = true;

    for row in rref.iter() {
        let mut pivot: Option<usize> = None;
        for (j, &value) in row.iter().enumerate().skip(last_pivot.map_or(0, |p| p + 1)) {
            if value.abs() <= epsilon { continue; }
            match pivot {
                None => {
                    pivot = Some(j);
                    last_pivot = Some(j);
                    pivot_count += 1;
                    solution[j] = 0.0;
                },
                Some(p) => {
                    solution[p] -= value;
                    solution[j] = 1.0;
                    no_solution = false;
                },
            }
        }
    }

    // exactly one column must be left without a pivot
    if no_solution || n - pivot_count != 1 { return Err(BalanceError::NoSolution); }
    // a zero or negative slot means some compound cannot take part (e.g. an element on one side only)
    if solution.iter().any(|&value| value <= epsilon) { return Err(BalanceError::NoSolution); }

    Ok(solution)
}

/// Performs Gaussian elimination with partial pivoting, leaving the matrix in row echelon form
/// # Arguments
/// * `matrix` - matrix to reduce
/// * `epsilon` - pivot candidates with smaller magnitude are treated as zero
/// # Example
/// ```
/// use chembalance::gaussian_elimination;
///
/// let mut matrix = vec![
///     vec![0.0, 2.0, -1.0],
///     vec![2.0, 0.0, -2.0],
/// ];
///
/// gaussian_elimination(&mut matrix, 1e-10);
///
/// assert_eq!(matrix, vec![
///     vec![2.0, 0.0, -2.0],
///     vec![0.0, 2.0, -1.0],
/// ]);
/// ```
pub fn gaussian_elimination(matrix: &mut [Vec<f64>], epsilon: f64) {
    let m = matrix.len();
    let n = matrix.first().map_or(0, Vec::len);

    let mut row = 0;
    let mut col = 0;
    while row < m && col < n {
        let mut i_max = row;
        for (i, row_n) in matrix.iter().enumerate().skip(row + 1) {
            if row_n[col].abs() > matrix[i_max][col].abs() {
                i_max = i;
            }
        }

        if matrix[i_max][col].abs() <= epsilon {
            for row_n in matrix.iter_mut().skip(row) {
                row_n[col] = 0.0;
            }
            col += 1;
        } else {
            matrix.swap(row, i_max);
            let (top, bot) = matrix.split_at_mut(row + 1);
            let pivot_row = &top[row];
            for row_n in bot.iter_mut() {
                let f = row_n[col] / pivot_row[col];
                row_n[col] = 0.0;
                for (value, pivot_value) in zip(row_n.iter_mut(), pivot_row.iter()).skip(col + 1) {
                    *value -= f * pivot_value;
                }
            }

            row += 1;
            col += 1;
        }
    }
}

/// Reduces matrix in row echelon form to reduced row echelon form
/// Every leading coefficient becomes 1 and everything above it becomes 0
/// # Arguments
/// * `matrix` - matrix in row echelon form
/// * `epsilon` - values with smaller magnitude are set to exactly zero
/// # Example
/// ```
/// use chembalance::reduce_row_echelon;
///
/// let mut matrix = vec![
///     vec![2.0, 0.0, -2.0],
///     vec![0.0, 2.0, -1.0],
/// ];
///
/// reduce_row_echelon(&mut matrix, 1e-10);
///
/// assert_eq!(matrix, vec![
///     vec![1.0, 0.0, -1.0],
///     vec![0.0, 1.0, -0.5],
/// ]);
/// ```
pub fn reduce_row_echelon(matrix: &mut [Vec<f64>], epsilon: f64) {
    for r in (0..matrix.len()).rev() {
        for value in matrix[r].iter_mut() {
            if value.abs() <= epsilon { *value = 0.0; }
        }
        let Some(lead) = matrix[r].iter().position(|x| *x != 0.0) else { continue };

        let factor = matrix[r][lead];
        for value in matrix[r].iter_mut() {
            *value /= factor;
        }
        matrix[r][lead] = 1.0;

        // we are processing matrix from bottom to top, so only rows above need to be cleared
        let (top, bot) = matrix.split_at_mut(r);
        let pivot_row = &bot[0];
        for row_n in top.iter_mut() {
            let f = row_n[lead];
            if f == 0.0 { continue; }
            for (value, pivot_value) in zip(row_n.iter_mut(), pivot_row.iter()).skip(lead) {
                *value -= f * pivot_value;
            }
            row_n[lead] = 0.0;
        }
    }

    for value in matrix.iter_mut().flatten() {
        if value.abs() <= epsilon { *value = 0.0; }
    }
}





/// Converts real solution vector to the smallest integer vector with the same ratios
/// For every entry the smallest denominator up to `options.max_denominator` is searched,
/// the vector is then multiplied by the least common multiple of all denominators
/// # Arguments
/// * `vector` - real solution vector
/// * `options` - tolerance and denominator bound
/// # Returns
/// * `Ok` - integer vector
/// * `Err` - some entry has no denominator within the bound, or the scaled vector does not fit in `i64`
/// # Example
/// ```
/// use chembalance::{normalize, BalanceOptions};
///
/// let integers = normalize(&[1.0 / 3.0, 0.25, 1.0], &BalanceOptions::default()).unwrap();
/// assert_eq!(integers, vec![4, 3, 12]);
/// ```
pub fn normalize(vector: &[f64], options: &BalanceOptions) -> Result<Vec<i64>, BalanceError> {
    let mut lcm = Natural::ONE;
    for (index, &entry) in vector.iter().enumerate() {
        let denominator = (1..=options.max_denominator)
            .find(|&j| {
                let scaled = entry * j as f64;
                (scaled - scaled.round()).abs() < options.epsilon
            })
            .ok_or(BalanceError::Unnormalizable { index })?;
        lcm = lcm.lcm(Natural::from(denominator));
    }

    let multiplier = u64::try_from(&lcm).map_err(|_| BalanceError::Overflow)? as f64;

    vector.iter()
        .map(|entry| {
            let scaled = (entry * multiplier).round();
            if scaled.abs() < i64::MAX as f64 { Ok(scaled as i64) } else { Err(BalanceError::Overflow) }
        })
        .collect()
}





/// Balances equation and returns coefficients (reactants first)
/// # Example
/// ```
/// use chembalance::{balance, BalanceError};
///
/// assert_eq!(balance("H2 + O2 = H2O").unwrap(), vec![2, 1, 2]);
/// assert_eq!(balance("H2 + O2"), Err(BalanceError::MalformedEquation));
/// assert_eq!(balance("H2 = O2"), Err(BalanceError::NoSolution));
/// ```
pub fn balance(equation: &str) -> Result<Vec<i64>, BalanceError> {
    balance_with(equation, &BalanceOptions::default())
}

/// Balances equation with custom options and returns coefficients (reactants first)
pub fn balance_with(equation: &str, options: &BalanceOptions) -> Result<Vec<i64>, BalanceError> {
    let mut equation = Equation::parse(equation)?;
    equation.solve_with(options)?;
    equation.coefficients().ok_or(BalanceError::NoSolution)
}

/// Balances equation and returns it as a string
/// # Example
/// ```
/// use chembalance::balance_str;
///
/// assert_eq!(balance_str("H2 + O2 = H2O").unwrap(), "2 H2 + 1 O2 = 2 H2O");
/// ```
pub fn balance_str(equation: &str) -> Result<String, BalanceError> {
    let mut equation = Equation::parse(equation)?;
    equation.solve()?;
    equation.solution_str().ok_or(BalanceError::NoSolution)
}





#[cfg(test)]
mod tests {
    use super::*;

    fn element(symbol: &str, count: u64) -> FormulaNode {
        FormulaNode::Element { symbol: symbol.to_string(), count }
    }

    fn counts(pairs: &[(&str, u64)]) -> ElementCounts {
        pairs.iter().map(|(symbol, count)| (symbol.to_string(), *count)).collect()
    }

    fn test_equation(equation: &str, expected: &[i64]) {
        assert_eq!(balance(equation).unwrap(), expected, "{}", equation);
    }

    fn assert_conserved(equation: &str) {
        let mut eq = Equation::parse(equation).unwrap();
        eq.solve().unwrap();
        let reacts = eq.solution_reactants().unwrap();
        let prods = eq.solution_products().unwrap();

        let mut left: BTreeMap<String, i64> = BTreeMap::new();
        for (compound, coeff) in zip(eq.reactants(), reacts) {
            for (e, q) in compound.elements() {
                *left.entry(e.clone()).or_insert(0) += *q as i64 * coeff;
            }
        }
        let mut right: BTreeMap<String, i64> = BTreeMap::new();
        for (compound, coeff) in zip(eq.products(), prods) {
            for (e, q) in compound.elements() {
                *right.entry(e.clone()).or_insert(0) += *q as i64 * coeff;
            }
        }
        assert_eq!(left, right);
    }


    #[test]
    fn tokenize_empty() {
        assert!(tokenize("").unwrap().is_empty());
        assert!(decompose("").unwrap().is_empty());
    }

    #[test]
    fn tokenize_markup() {
        assert_eq!(tokenize("H_{2}O").unwrap(), vec![element("H", 2), element("O", 1)]);
        assert_eq!(decompose(r"Ca\left(OH\right)_{2}").unwrap(), counts(&[("Ca", 1), ("H", 2), ("O", 2)]));
    }

    #[test]
    fn tokenize_leading_coefficient() {
        assert_eq!(tokenize("2H2O").unwrap(), vec![element("H", 2), element("O", 1)]);
        assert_eq!(tokenize("3 O2").unwrap(), vec![element("O", 2)]);
    }

    #[test]
    fn tokenize_nested_groups() {
        let nodes = tokenize("K4[Fe(CN)6]").unwrap();
        assert_eq!(nodes, vec![
            element("K", 4),
            FormulaNode::Group {
                text: String::from("Fe(CN)6"),
                children: vec![
                    element("Fe", 1),
                    FormulaNode::Group { text: String::from("CN"), children: vec![element("C", 1), element("N", 1)], count: 6 },
                ],
                count: 1,
            },
        ]);
    }

    #[test]
    fn tokenize_superscript_ends_multiplier() {
        let nodes = tokenize("(SO4)^{2-}").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].count(), 1);
    }

    #[test]
    fn tokenize_unbalanced_brackets() {
        assert_eq!(tokenize("H2)O").unwrap(), vec![element("H", 2), element("O", 1)]);
        assert_eq!(decompose("Ca(OH").unwrap(), counts(&[("Ca", 1), ("H", 1), ("O", 1)]));
    }

    #[test]
    fn tokenize_nesting_limit() {
        let formula = format!("{}H", "(".repeat(MAX_NESTING + 1));
        assert_eq!(tokenize(&formula), Err(BalanceError::NestingTooDeep { limit: MAX_NESTING }));

        let formula = format!("{}H{})", "(".repeat(MAX_NESTING), ")2".repeat(MAX_NESTING - 1));
        assert_eq!(decompose(&formula).unwrap(), counts(&[("H", 1 << 63)]));

        let formula = format!("{}H{}", "(".repeat(MAX_NESTING), ")2".repeat(MAX_NESTING));
        assert_eq!(decompose(&formula), Err(BalanceError::Overflow));
    }

    #[test]
    fn decompose_count_overflow() {
        assert_eq!(decompose("H18446744073709551615").unwrap(), counts(&[("H", u64::MAX)]));
        assert_eq!(tokenize("H18446744073709551616"), Err(BalanceError::Overflow));
        assert_eq!(tokenize("(OH)99999999999999999999"), Err(BalanceError::Overflow));
        assert_eq!(decompose("H18446744073709551615H"), Err(BalanceError::Overflow));
        assert_eq!(balance("H99999999999999999999 + O2 = H2O"), Err(BalanceError::Overflow));
    }

    #[test]
    fn decompose_groups() {
        assert_eq!(decompose("Mg(OH)2").unwrap(), counts(&[("Mg", 1), ("O", 2), ("H", 2)]));
        assert_eq!(decompose("K4[Fe(CN)6]").unwrap(), counts(&[("K", 4), ("Fe", 1), ("C", 6), ("N", 6)]));
        assert_eq!(decompose("((OH)2)3").unwrap(), counts(&[("O", 6), ("H", 6)]));
        assert_eq!(
            decompose("[Cr(N2H4CO)6]4[Cr(CN)6]3").unwrap(),
            counts(&[("C", 42), ("Cr", 7), ("H", 96), ("N", 66), ("O", 24)]),
        );
    }

    #[test]
    fn decompose_group_text_matches_children() {
        for node in tokenize("Al2(SO4)3[Fe(CN)6]2").unwrap() {
            if let FormulaNode::Group { text, children, .. } = &node {
                assert_eq!(decompose(text).unwrap(), sum_nodes(children).unwrap());
            }
        }
    }

    #[test]
    fn decompose_without_groups() {
        assert_eq!(decompose("CH3CH2OH").unwrap(), counts(&[("C", 2), ("H", 6), ("O", 1)]));
        assert_eq!(decompose("C6H12O6").unwrap(), counts(&[("C", 6), ("H", 12), ("O", 6)]));
    }

    #[test]
    fn parse_malformed() {
        assert_eq!(Equation::parse("H2 + O2"), Err(BalanceError::MalformedEquation));
        assert_eq!(Equation::parse("= H2O"), Err(BalanceError::MalformedEquation));
        assert_eq!(Equation::parse("H2 = O2 = O3"), Err(BalanceError::MalformedEquation));
        assert_eq!(Equation::parse("H2 + + O2 = H2O"), Err(BalanceError::MalformedEquation));
        assert_eq!(Equation::parse("H2 + O2 => H2O"), Err(BalanceError::MalformedEquation));
    }

    #[test]
    fn parse_separators() {
        assert_eq!(Equation::parse("H2 + O2 = H2O").unwrap().separator(), "=");
        assert_eq!(Equation::parse("H2 + O2 -> H2O").unwrap().separator(), "->");
        assert_eq!(Equation::parse("H2 + O2 <-> H2O").unwrap().separator(), "<->");
        assert_eq!(Equation::parse("H2 + O2 > H2O").unwrap().separator(), ">");
    }

    #[test]
    fn matrix_no_elements() {
        let equation = Equation::parse("2 = 3").unwrap();
        assert_eq!(equation.matrix(), Err(BalanceError::NoCommonElements));
        assert_eq!(balance("2 = 3"), Err(BalanceError::NoCommonElements));
    }

    #[test]
    fn matrix_first_seen_order() {
        let matrix = Equation::parse("KMnO4 + HCl = KCl + MnCl2 + H2O + Cl2").unwrap().matrix().unwrap();
        assert_eq!(matrix.elements(), &["K", "Mn", "O", "Cl", "H"]);
        assert_eq!(matrix.terms(), 6);
        assert_eq!(matrix.rows()[3], vec![0.0, 1.0, -1.0, -2.0, 0.0, -2.0]);
    }

    #[test]
    fn null_space_multi_dimensional() {
        // H2O and H2O2 can be produced in any ratio
        assert_eq!(balance("H2 + O2 = H2O + H2O2"), Err(BalanceError::NoSolution));
    }

    #[test]
    fn null_space_element_on_one_side() {
        assert_eq!(balance("H2 = O2"), Err(BalanceError::NoSolution));
        assert_eq!(balance("Na + H2O = NaOH"), Err(BalanceError::NoSolution));
        // rank is still one less than the number of terms, the null vector has a zero slot
        assert_eq!(balance("H2 + O2 + N2 = H2O"), Err(BalanceError::NoSolution));
        assert_eq!(balance("H2 + O2 = H2O + N2"), Err(BalanceError::NoSolution));
    }

    #[test]
    fn normalize_fractions() {
        let options = BalanceOptions::default();
        assert_eq!(normalize(&[1.0, 0.5, 1.0], &options).unwrap(), vec![2, 1, 2]);
        assert_eq!(normalize(&[2.0, 3.0], &options).unwrap(), vec![2, 3]);
        assert_eq!(normalize(&[0.6, 0.75], &options).unwrap(), vec![12, 15]);
    }

    #[test]
    fn normalize_bound() {
        let options = BalanceOptions { max_denominator: 1, ..BalanceOptions::default() };
        assert_eq!(normalize(&[1.0, 0.5], &options), Err(BalanceError::Unnormalizable { index: 1 }));
        assert_eq!(balance_with("H2 + O2 = H2O", &options), Err(BalanceError::Unnormalizable { index: 1 }));

        let options = BalanceOptions::default();
        assert_eq!(normalize(&[1.0, std::f64::consts::PI], &options), Err(BalanceError::Unnormalizable { index: 1 }));
    }

    #[test]
    fn normalize_overflow() {
        // pairwise coprime denominators whose product exceeds u64::MAX
        let vector = [1.0 / 99991.0, 1.0 / 99989.0, 1.0 / 99971.0, 1.0 / 99961.0];
        assert_eq!(normalize(&vector, &BalanceOptions::default()), Err(BalanceError::Overflow));

        // the lcm fits in u64 but the scaled entry does not fit in i64
        let vector = [1.0 / 99991.0, 1.0 / 99989.0, 1.0e9];
        assert_eq!(normalize(&vector, &BalanceOptions::default()), Err(BalanceError::Overflow));
    }

    #[test]
    fn validate_elements() {
        let strict = BalanceOptions { validate_elements: true, ..BalanceOptions::default() };
        assert_eq!(balance("Xx + O2 = XxO2").unwrap(), vec![1, 1, 1]);
        assert_eq!(balance_with("Xx + O2 = XxO2", &strict), Err(BalanceError::UnknownElement(String::from("Xx"))));
        assert_eq!(balance_with("Mg(OH)2 + HCl = MgCl2 + H2O", &strict).unwrap(), vec![1, 2, 1, 2]);
    }

    #[test]
    fn solution_string() {
        assert_eq!(balance_str("H2 + O2 = H2O").unwrap(), "2 H2 + 1 O2 = 2 H2O");
        assert_eq!(balance_str("H2 + O2 <-> H2O").unwrap(), "2 H2 + 1 O2 <-> 2 H2O");
        assert_eq!(balance_str("H_{2} + O_{2} = H_{2}O").unwrap(), "2 H_{2} + 1 O_{2} = 2 H_{2}O");
        assert_eq!(balance_str("  KClO3=KCl +O2 ").unwrap(), "2 KClO3 = 2 KCl + 3 O2");
    }

    #[test]
    fn rebalance_scaled() {
        assert_eq!(balance("4 H2 + 2 O2 = 4 H2O").unwrap(), vec![2, 1, 2]);
        let balanced = balance_str("Fe + O2 = Fe2O3").unwrap();
        assert_eq!(balance(&balanced).unwrap(), vec![4, 3, 2]);
        assert_eq!(balance("12 Fe + 9 O2 = 6 Fe2O3").unwrap(), vec![4, 3, 2]);
    }

    #[test]
    fn arrow_types() {
        for arrow in ["=", "->", "<->", ">"] {
            let eq_str = format!("H2 + O2 {} H2O", arrow);
            assert_eq!(balance_str(&eq_str).unwrap(), format!("2 H2 + 1 O2 {} 2 H2O", arrow));
        }
    }

    #[test]
    fn conservation() {
        assert_eq!(balance("KMnO4 + HCl = KCl + MnCl2 + H2O + Cl2").unwrap(), vec![2, 16, 2, 2, 8, 5]);
        assert_conserved("KMnO4 + HCl = KCl + MnCl2 + H2O + Cl2");
        assert_conserved("K4[Fe(SCN)6] + K2Cr2O7 + H2SO4 = Fe2(SO4)3 + Cr2(SO4)3 + CO2 + H2O + K2SO4 + KNO3");
    }

    #[test]
    fn eq1() {
        test_equation("H2 + O2 = H2O", &[2, 1, 2]);
    }

    #[test]
    fn eq2() {
        test_equation("Fe + O2 = Fe2O3", &[4, 3, 2]);
    }

    #[test]
    fn eq3() {
        test_equation("[Cr(N2H4CO)6]4[Cr(CN)6]3 + KMnO4 + H2SO4 = K2Cr2O7 + MnSO4 + CO2 + KNO3 + K2SO4 + H2O", &[10, 1176, 1399, 35, 1176, 420, 660, 223, 1879]);
    }

    #[test]
    fn eq4() {
        test_equation("K4[Fe(SCN)6] + K2Cr2O7 + H2SO4 = Fe2(SO4)3 + Cr2(SO4)3 + CO2 + H2O + K2SO4 + KNO3", &[6, 97, 355, 3, 97, 36, 355, 91, 36]);
    }

    #[test]
    fn eq5() {
        test_equation("Fe2(SO4)3 + KOH = K2SO4 + Fe(OH)3", &[1, 6, 3, 2]);
    }

    #[test]
    fn eq6() {
        test_equation("Ca3(PO4)2 + SiO2 = P4O10 + CaSiO3", &[2, 6, 1, 6]);
    }

    #[test]
    fn eq7() {
        test_equation("KClO3 = KClO4 + KCl", &[4, 3, 1]);
    }

    #[test]
    fn eq8() {
        test_equation("C57H110O6 + O2 = CO2 + H2O", &[2, 163, 114, 110]);
    }

    #[test]
    fn eq9() {
        test_equation("Cu + HNO3 = Cu(NO3)2 + NO + H2O", &[3, 8, 3, 2, 4]);
    }

    #[test]
    fn eq10() {
        test_equation("KNO3 + C12H22O11 = N2 + CO2 + H2O + K2CO3", &[48, 5, 24, 36, 55, 24]);
    }

    #[test]
    fn eq11() {
        test_equation("Cu2S + HNO3 = Cu(NO3)2 + CuSO4 + NO2 + H2O", &[1, 12, 1, 1, 10, 6]);
    }

    #[test]
    fn eq12() {
        test_equation("CO2 + H2O -> C6H12O6 + O2", &[6, 6, 1, 6]);
    }

    #[test]
    fn eq13() {
        test_equation("Al2(SO4)3 + Ca(OH)2 = Al(OH)3 + CaSO4", &[1, 3, 2, 3]);
    }

    #[test]
    fn eq14() {
        test_equation("NaBr + NaBrO3 + H2SO4 = Br2 + Na2SO4 + H2O", &[5, 1, 3, 3, 3, 3]);
    }

    #[test]
    fn eq15() {
        test_equation("H2O = H2 + O2", &[2, 2, 1]);
    }
}
