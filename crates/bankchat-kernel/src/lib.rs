use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const FREE_FORM_CODE: &str = "000";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed_code: expected exactly 3 decimal digits, got {0:?}")]
    Malformed(String),
}

/// Position inside a guided flow, carried by the client between turns.
///
/// The server never stores it; every request brings its own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateCode {
    pub topic: u8,
    pub subtype: u8,
    pub step: u8,
}

impl StateCode {
    pub const FREE_FORM: StateCode = code(0, 0, 0);

    pub fn new(topic: u8, subtype: u8, step: u8) -> Option<Self> {
        if topic > 9 || subtype > 9 || step > 9 {
            return None;
        }
        Some(code(topic, subtype, step))
    }

    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        match raw.as_bytes() {
            [t, s, st] if [t, s, st].iter().all(|b| b.is_ascii_digit()) => {
                Ok(code(t - b'0', s - b'0', st - b'0'))
            }
            _ => Err(ParseError::Malformed(raw.to_string())),
        }
    }

    pub fn is_free_form(&self) -> bool {
        *self == Self::FREE_FORM
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.topic, self.subtype, self.step)
    }
}

impl FromStr for StateCode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for StateCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StateCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

const fn code(topic: u8, subtype: u8, step: u8) -> StateCode {
    StateCode {
        topic,
        subtype,
        step,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuOption {
    pub code: StateCode,
    pub label: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    Prompt {
        text: &'static str,
        next: StateCode,
    },
    Menu {
        text: &'static str,
        options: &'static [MenuOption],
    },
    Terminal {
        redirect: &'static str,
        title: &'static str,
    },
}

impl FlowTransition {
    fn targets(&self) -> Vec<StateCode> {
        match self {
            FlowTransition::Prompt { next, .. } => vec![*next],
            FlowTransition::Menu { options, .. } => options.iter().map(|o| o.code).collect(),
            FlowTransition::Terminal { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topic {
    pub entry: StateCode,
    pub label: &'static str,
}

/// Entry points of every guided flow, in the order clients show them.
pub const TOPICS: &[Topic] = &[
    Topic {
        entry: code(1, 0, 0),
        label: "Открытие кредита",
    },
    Topic {
        entry: code(2, 0, 0),
        label: "Открытие вклада",
    },
    Topic {
        entry: code(3, 0, 0),
        label: "Обмен валюты",
    },
    Topic {
        entry: code(4, 0, 0),
        label: "Перевод",
    },
    Topic {
        entry: code(5, 0, 0),
        label: "История операций",
    },
    Topic {
        entry: code(6, 0, 0),
        label: "Расход за период",
    },
];

const CREDIT_MENU: &[MenuOption] = &[
    MenuOption {
        code: code(1, 1, 0),
        label: "Потребительский",
    },
    MenuOption {
        code: code(1, 2, 0),
        label: "Автокредит",
    },
    MenuOption {
        code: code(1, 3, 0),
        label: "Ипотека",
    },
];

const CREDIT_HISTORY_TITLE: &str = "История операций";

/// Loan subtypes sharing the applicant tail, with their terminal redirect.
const CREDIT_PRODUCTS: &[(u8, &str)] = &[
    (1, "api/consumercredits/"),
    (2, "api/autocredits/"),
    (3, "api/mortgages/"),
];

const CREDIT_TAIL_PROMPTS: &[(u8, &str)] = &[
    (5, "Укажите Наименование"),
    (6, "Укажите ИНН"),
    (7, "Укажите Фактический адрес компании по месту вашей работы"),
    (
        8,
        "Укажите Среднемесячный доход после уплаты налогов за последние 12 месяцев",
    ),
];

const CREDIT_TAIL_TERMINAL_STEP: u8 = 9;

const DEPOSIT_TERMS: &str = "Условия договора:\n Срок договора - 36 месяцев\n Расторжение без потери % ежеквартально\n Выплата % ежеквартально\n Без пополнения\n С капитализацией\n Без автопролонгации\n Хотите открыть вклад?";

fn prompt(text: &'static str, next: StateCode) -> FlowTransition {
    FlowTransition::Prompt { text, next }
}

fn terminal(redirect: &'static str, title: &'static str) -> FlowTransition {
    FlowTransition::Terminal { redirect, title }
}

fn topic_rows() -> Vec<(StateCode, FlowTransition)> {
    vec![
        // credit
        (
            code(1, 0, 0),
            FlowTransition::Menu {
                text: "Какой кредит вы хотите открыть?",
                options: CREDIT_MENU,
            },
        ),
        (code(1, 1, 0), prompt("Какая у вас цель кредитования?", code(1, 1, 1))),
        (code(1, 1, 1), prompt("На какую сумму вы хотите взять кредит?", code(1, 1, 2))),
        (code(1, 1, 2), prompt("На какой срок вы планируете взять кредит?", code(1, 1, 5))),
        (code(1, 2, 0), prompt("Какая стоимость автомобиля?", code(1, 2, 1))),
        (code(1, 2, 1), prompt("Каков первоначальный взнос?", code(1, 2, 2))),
        (code(1, 2, 2), prompt("На какой срок вы планируете взять кредит?", code(1, 2, 5))),
        (code(1, 3, 0), prompt("Какая у вас цель кредитования?", code(1, 3, 1))),
        (code(1, 3, 1), prompt("На какую сумму вы хотите взять кредит?", code(1, 3, 2))),
        (code(1, 3, 2), prompt("Каков первоначальный взнос?", code(1, 3, 3))),
        (code(1, 3, 3), prompt("На какой срок вы планируете взять кредит?", code(1, 3, 5))),
        // deposit
        (code(2, 0, 0), prompt(DEPOSIT_TERMS, code(2, 1, 0))),
        (code(2, 1, 0), prompt("Какая сумма вклада?", code(2, 2, 0))),
        (code(2, 2, 0), prompt("Какой срок размещения?", code(2, 3, 0))),
        (code(2, 3, 0), terminal("api/contributions", "Открытие вклада")),
        // currency exchange
        (code(3, 0, 0), prompt("Какую валюту вы хотите обменять?", code(3, 1, 0))),
        (code(3, 1, 0), prompt("На какую валюту вы хотите обменять?", code(3, 2, 0))),
        (code(3, 2, 0), prompt("Сколько вы хотите обменять?", code(3, 3, 0))),
        (code(3, 3, 0), terminal("api/currencyexchanges", "Обмен валюты")),
        // transfer
        (code(4, 0, 0), prompt("С какого счета вы хотите перевести деньги?", code(4, 1, 0))),
        (
            code(4, 1, 0),
            prompt(
                "Укажите номер счета на который вы хотите перевести деньги?",
                code(4, 2, 0),
            ),
        ),
        (code(4, 2, 0), prompt("Укажите сумму перевода?", code(4, 3, 0))),
        (code(4, 3, 0), terminal("api/transactions", "Перевод")),
        // history
        (code(5, 0, 0), terminal("api/historyOperations", "История операций")),
        // spend over period
        (
            code(6, 0, 0),
            prompt("С какого по какое число вы хотите узнать расход средств?", code(6, 1, 0)),
        ),
        (code(6, 1, 0), terminal("periodSpend", "Расход за период")),
    ]
}

/// Applicant steps 5..=9 common to every loan subtype.
fn credit_tail_rows() -> Vec<(StateCode, FlowTransition)> {
    let mut rows = Vec::new();
    for &(subtype, redirect) in CREDIT_PRODUCTS {
        for &(step, text) in CREDIT_TAIL_PROMPTS {
            rows.push((code(1, subtype, step), prompt(text, code(1, subtype, step + 1))));
        }
        rows.push((
            code(1, subtype, CREDIT_TAIL_TERMINAL_STEP),
            terminal(redirect, CREDIT_HISTORY_TITLE),
        ));
    }
    rows
}

#[derive(Debug, Clone)]
pub struct FlowTable {
    rows: HashMap<StateCode, FlowTransition>,
}

impl FlowTable {
    /// Process-wide table, built on first use and never mutated.
    pub fn global() -> &'static FlowTable {
        static TABLE: OnceLock<FlowTable> = OnceLock::new();
        TABLE.get_or_init(FlowTable::build)
    }

    pub fn build() -> Self {
        Self::merge(topic_rows(), credit_tail_rows())
    }

    /// Subtype-specific rows win over shared rows for the same key.
    fn merge(
        specific: Vec<(StateCode, FlowTransition)>,
        shared: Vec<(StateCode, FlowTransition)>,
    ) -> Self {
        let mut rows: HashMap<StateCode, FlowTransition> = specific.into_iter().collect();
        for (key, transition) in shared {
            rows.entry(key).or_insert(transition);
        }
        Self { rows }
    }

    pub fn lookup(&self, code: StateCode) -> Option<&FlowTransition> {
        self.rows.get(&code)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn codes(&self) -> Vec<StateCode> {
        let mut codes: Vec<StateCode> = self.rows.keys().copied().collect();
        codes.sort();
        codes
    }

    /// `(from, to)` pairs whose target is neither a row nor the free-form sentinel.
    pub fn dangling_transitions(&self) -> Vec<(StateCode, StateCode)> {
        let mut dangling = Vec::new();
        for from in self.codes() {
            if let Some(transition) = self.rows.get(&from) {
                for to in transition.targets() {
                    if !to.is_free_form() && !self.rows.contains_key(&to) {
                        dangling.push((from, to));
                    }
                }
            }
        }
        dangling
    }
}

pub fn lookup(code: StateCode) -> Option<&'static FlowTransition> {
    FlowTable::global().lookup(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk_prompts(start: StateCode) -> (Vec<&'static str>, FlowTransition) {
        let mut prompts = Vec::new();
        let mut current = start;
        loop {
            match lookup(current).expect("walk left the table") {
                FlowTransition::Prompt { text, next } => {
                    prompts.push(*text);
                    current = *next;
                }
                other => return (prompts, *other),
            }
        }
    }

    #[test]
    fn parse_accepts_three_digits() {
        let c = StateCode::parse("137").unwrap();
        assert_eq!((c.topic, c.subtype, c.step), (1, 3, 7));
        assert_eq!(c.to_string(), "137");
        assert!(StateCode::parse(FREE_FORM_CODE).unwrap().is_free_form());
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        for raw in ["", "12", "abc", "1234", " 12", "12a", "-12", "１２３", "1.2"] {
            assert!(
                matches!(StateCode::parse(raw), Err(ParseError::Malformed(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn every_three_digit_code_round_trips_and_lookup_is_total() {
        for n in 0..1000u32 {
            let raw = format!("{n:03}");
            let c = StateCode::parse(&raw).unwrap();
            assert_eq!(c.to_string(), raw);
            let _ = lookup(c);
        }
    }

    #[test]
    fn serde_uses_the_string_form() {
        let c = StateCode::parse("415").unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"415\"");
        let back: StateCode = serde_json::from_str("\"415\"").unwrap();
        assert_eq!(back, c);
        assert!(serde_json::from_str::<StateCode>("\"41\"").is_err());
    }

    #[test]
    fn table_has_no_dangling_transitions() {
        let dangling = FlowTable::global().dangling_transitions();
        assert!(dangling.is_empty(), "dangling transitions: {dangling:?}");
    }

    #[test]
    fn every_row_reaches_a_terminal() {
        for start in FlowTable::global().codes() {
            let mut current = start;
            let mut hops = 0;
            while let Some(FlowTransition::Prompt { next, .. }) = lookup(current) {
                current = *next;
                hops += 1;
                assert!(hops < 20, "cycle starting at {start}");
            }
            assert!(lookup(current).is_some(), "{start} ends outside the table");
        }
    }

    #[test]
    fn consumer_credit_walk_ends_in_history_redirect() {
        let (prompts, end) = walk_prompts(code(1, 1, 0));
        assert_eq!(
            prompts,
            vec![
                "Какая у вас цель кредитования?",
                "На какую сумму вы хотите взять кредит?",
                "На какой срок вы планируете взять кредит?",
                "Укажите Наименование",
                "Укажите ИНН",
                "Укажите Фактический адрес компании по месту вашей работы",
                "Укажите Среднемесячный доход после уплаты налогов за последние 12 месяцев",
            ]
        );
        assert_eq!(
            end,
            FlowTransition::Terminal {
                redirect: "api/consumercredits/",
                title: "История операций",
            }
        );
    }

    #[test]
    fn loan_subtypes_share_tail_but_not_redirect() {
        let table = FlowTable::global();
        for subtype in 1..=3 {
            for &(step, text) in CREDIT_TAIL_PROMPTS {
                assert_eq!(
                    table.lookup(code(1, subtype, step)),
                    Some(&prompt(text, code(1, subtype, step + 1)))
                );
            }
        }
        let redirects: Vec<_> = (1..=3)
            .map(|s| match table.lookup(code(1, s, 9)) {
                Some(FlowTransition::Terminal { redirect, .. }) => *redirect,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            redirects,
            vec!["api/consumercredits/", "api/autocredits/", "api/mortgages/"]
        );
    }

    #[test]
    fn subtype_specific_row_wins_over_shared_tail() {
        let specific = vec![(code(1, 1, 5), prompt("override", code(1, 1, 9)))];
        let table = FlowTable::merge(specific, credit_tail_rows());
        assert_eq!(
            table.lookup(code(1, 1, 5)),
            Some(&prompt("override", code(1, 1, 9)))
        );
        assert_eq!(
            table.lookup(code(1, 2, 5)),
            Some(&prompt("Укажите Наименование", code(1, 2, 6)))
        );
    }

    #[test]
    fn topic_terminals_are_distinct() {
        let expect = [
            ("230", "api/contributions", "Открытие вклада"),
            ("330", "api/currencyexchanges", "Обмен валюты"),
            ("430", "api/transactions", "Перевод"),
            ("500", "api/historyOperations", "История операций"),
            ("610", "periodSpend", "Расход за период"),
        ];
        for (raw, redirect, title) in expect {
            assert_eq!(
                lookup(StateCode::parse(raw).unwrap()),
                Some(&FlowTransition::Terminal { redirect, title }),
                "{raw}"
            );
        }
    }

    #[test]
    fn transfer_flow_stays_inside_its_topic() {
        let mut current = code(4, 0, 0);
        while let Some(FlowTransition::Prompt { next, .. }) = lookup(current) {
            assert_eq!(next.topic, 4);
            current = *next;
        }
    }

    #[test]
    fn codes_outside_the_tree_are_not_found() {
        for raw in ["700", "999", "114", "140", "109", "240"] {
            assert!(lookup(StateCode::parse(raw).unwrap()).is_none(), "{raw}");
        }
    }

    #[test]
    fn every_topic_entry_is_a_row() {
        for topic in TOPICS {
            assert!(lookup(topic.entry).is_some(), "{}", topic.label);
        }
    }

    #[test]
    fn lookup_is_repeatable() {
        let c = code(3, 1, 0);
        assert_eq!(lookup(c), lookup(c));
    }
}
